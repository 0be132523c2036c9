//! sonde-probe — the per-cluster probing state machines.
//!
//! One probe instance runs per monitored cluster, as its own tokio task.
//! Each instance multiplexes independently scheduled check loops over a
//! single `select!` so that no check category can starve another's
//! scheduling, and stops cleanly when the watcher signals shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing  EsProbe::new() + prepare()   (failure → never registered)
//!      │
//! Running       run(shutdown) — select! over six interval timers:
//!      │          discovery refresh / node fan-out / durability /
//!      │          latency round-trip / restore / metric pruning
//!      │
//! Draining      shutdown observed at a tick boundary: final metric
//!      │        retraction for every node ever seen + cluster series
//!      ▼
//! Stopped       task returns
//! ```
//!
//! The Kibana flavor ([`KibanaProbe`]) is the same machine with only the
//! availability, discovery and pruning loops.

pub mod client;
pub mod config;
pub mod elasticsearch;
pub mod error;
pub mod kibana;
pub mod restore;

pub use client::{EsClient, EsDocument, SearchApiFlavor};
pub use config::SondeConfig;
pub use elasticsearch::EsProbe;
pub use error::{ProbeError, ProbeResult};
pub use kibana::KibanaProbe;
