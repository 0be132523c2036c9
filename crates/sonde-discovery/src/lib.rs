//! sonde-discovery — service discovery for monitored search clusters.
//!
//! Resolves Consul catalog entries into typed [`Node`] and [`Cluster`]
//! records, and tracks every node identity a probe has ever seen so that
//! metrics for vanished nodes can be retracted deterministically.
//!
//! # Architecture
//!
//! ```text
//! ServiceRegistry (trait)
//!   └── ConsulRegistry — reqwest client, stale-allowed catalog reads
//!
//! discover_nodes()    — service name → Vec<Node>
//! discover_clusters() — monitoring tag → cluster name → Cluster
//! cluster_endpoint()  — service name + suffix template → "host:port"
//!
//! KnownNodes — monotonically growing set of (name, cluster) identities
//! ```

pub mod discover;
pub mod error;
pub mod known;
pub mod registry;

pub use discover::{cluster_endpoint, discover_clusters, discover_nodes, Cluster, Node};
pub use error::{DiscoveryError, DiscoveryResult};
pub use known::{KnownNodes, NodeId};
pub use registry::{CatalogEntry, ConsulRegistry, ServiceRegistry};
