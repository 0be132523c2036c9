//! sonde-metrics — the measurement sink for all probes.
//!
//! One [`SondeMetrics`] instance is built against a caller-supplied
//! `prometheus::Registry` at startup and injected into every component
//! that emits measurements; nothing here is ambient global state.
//!
//! Besides emission, the sink owns the retraction paths: when a node
//! vanishes from discovery its per-node label series are deleted, and
//! when a whole cluster disappears its cluster-level series go with it.

pub mod sink;

pub use sink::{NodeKind, SondeMetrics, OPERATIONS};
