//! sonde-watcher — the cluster lifecycle orchestrator.
//!
//! Polls the registry for every cluster carrying a monitoring tag, diffs
//! the result against the probes currently running, starts new probe
//! tasks (after their preparation step) and signals shutdown to probes
//! whose cluster vanished. Runs forever on a fixed cadence; one
//! cluster's failure never stops a reconciliation pass.

pub mod watcher;

pub use watcher::Watcher;
