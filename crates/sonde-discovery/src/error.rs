//! Discovery error types.

use thiserror::Error;

/// Errors that can occur while talking to the service registry.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("service {0} has no healthy instances")]
    NoHealthyInstance(String),

    #[error("malformed registry response: {0}")]
    Malformed(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
