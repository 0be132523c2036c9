//! Probe error types.
//!
//! Every error carries the operation and target (cluster, index or node
//! URL) it failed against, so a log line is enough to locate the broken
//! piece without a stack trace.

use thiserror::Error;

use sonde_discovery::DiscoveryError;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("{operation} on {target} returned status {status}")]
    Status {
        operation: &'static str,
        target: String,
        status: u16,
    },

    #[error("unexpected {operation} response from {target}: {message}")]
    Shape {
        operation: &'static str,
        target: String,
        message: String,
    },
}

pub type ProbeResult<T> = Result<T, ProbeError>;
