//! Node and cluster discovery.
//!
//! Turns raw registry entries into typed [`Node`] and [`Cluster`] records.
//! Cluster identity comes from the `cluster_name-*` tag, not from the raw
//! service name; the scheme defaults to `http` unless an `https` tag is
//! present. Missing tags yield empty strings, never errors — callers treat
//! an unclassified node as probeable, just unlabelled.

use std::collections::HashMap;

use tracing::debug;

use crate::error::DiscoveryResult;
use crate::registry::ServiceRegistry;

/// One addressable instance of a monitored cluster.
///
/// Identity is `(name, cluster)`. Node lists are replaced wholesale on
/// every discovery refresh; a `Node` is never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub cluster: String,
    pub scheme: String,
}

/// One monitored cluster, identified by its derived cluster name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Raw registry service name (used for node discovery).
    pub service: String,
    pub scheme: String,
    /// Version string advertised via the `version-*` tag.
    pub version: String,
}

impl Cluster {
    /// Parsed major version, if the version tag carries one.
    ///
    /// Branching on the parsed major (rather than a string prefix) keeps
    /// `"60.0"` from being mistaken for a 6.x cluster.
    pub fn major_version(&self) -> Option<u32> {
        self.version.split('.').next()?.parse().ok()
    }
}

/// Extract the value of a `prefix-value` tag; absent tags yield `""`.
pub fn value_from_tags(prefix: &str, tags: &[String]) -> String {
    for tag in tags {
        if let Some((key, value)) = tag.split_once('-') {
            if key == prefix {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// `https` when an `https` tag is present, `http` otherwise.
pub fn scheme_from_tags(tags: &[String]) -> String {
    if tags.iter().any(|t| t == "https") {
        "https".to_string()
    } else {
        "http".to_string()
    }
}

/// Resolve the current node list for a cluster's service.
///
/// Entries with an empty per-instance address fall back to the node-level
/// address. The result is never partially populated: any registry failure
/// surfaces as an error instead.
pub async fn discover_nodes(
    registry: &dyn ServiceRegistry,
    service_name: &str,
) -> DiscoveryResult<Vec<Node>> {
    let entries = registry.resolve_service(service_name).await?;

    let nodes: Vec<Node> = entries
        .into_iter()
        .map(|entry| {
            let address = if entry.service_address.is_empty() {
                entry.address
            } else {
                entry.service_address
            };
            Node {
                name: entry.node,
                address,
                port: entry.service_port,
                cluster: value_from_tags("cluster_name", &entry.service_tags),
                scheme: scheme_from_tags(&entry.service_tags),
            }
        })
        .collect();

    debug!(service = service_name, nodes = nodes.len(), "nodes discovered");
    Ok(nodes)
}

/// Find every cluster currently advertising `monitoring_tag`.
///
/// Deduplicates by derived cluster name; when several service names share
/// one cluster name the first match wins and later ones are ignored. That
/// coarsening is long-standing observable behavior and is kept as is.
pub async fn discover_clusters(
    registry: &dyn ServiceRegistry,
    monitoring_tag: &str,
) -> DiscoveryResult<HashMap<String, Cluster>> {
    let services = registry.list_services().await?;

    let mut clusters = HashMap::new();
    for (service_name, tags) in services {
        if !tags.iter().any(|t| t == monitoring_tag) {
            continue;
        }
        let cluster_name = value_from_tags("cluster_name", &tags);
        clusters.entry(cluster_name).or_insert_with(|| Cluster {
            service: service_name,
            scheme: scheme_from_tags(&tags),
            version: value_from_tags("version", &tags),
        });
    }
    Ok(clusters)
}

/// Build the cluster-level endpoint `"{service}{suffix}:{port}"`.
///
/// A `{dc}` placeholder in the suffix is replaced by the datacenter of a
/// healthy instance; the port comes from the same instance unless a
/// non-zero `port_override` is given.
pub async fn cluster_endpoint(
    registry: &dyn ServiceRegistry,
    service_name: &str,
    endpoint_suffix: &str,
    port_override: u16,
) -> DiscoveryResult<String> {
    let (port, datacenter) = registry.healthy_instance(service_name).await?;
    let port = if port_override != 0 { port_override } else { port };
    let suffix = endpoint_suffix.replace("{dc}", &datacenter);
    Ok(format!("{service_name}{suffix}:{port}"))
}
