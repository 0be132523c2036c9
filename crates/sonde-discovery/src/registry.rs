//! Service registry boundary.
//!
//! The rest of the system only sees the [`ServiceRegistry`] trait; the
//! shipped implementation is a thin Consul HTTP API client. Catalog reads
//! are stale-allowed on purpose: discovery runs on a slow cadence and a
//! slightly outdated member list is corrected on the next refresh.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{DiscoveryError, DiscoveryResult};

/// One catalog entry for a service: the registry node it lives on plus
/// the per-instance service registration.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Registry node name (the node identity used in metrics labels).
    pub node: String,
    /// Node-level address, used when the service registration has none.
    pub address: String,
    /// Per-instance service address; may be empty.
    pub service_address: String,
    /// Per-instance service port.
    pub service_port: u16,
    /// Service tags (`cluster_name-*`, `version-*`, `https`, ...).
    pub service_tags: Vec<String>,
}

/// Read-only view of the service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Resolve all catalog entries currently registered for a service.
    async fn resolve_service(&self, name: &str) -> DiscoveryResult<Vec<CatalogEntry>>;

    /// List every known service name with its tags.
    async fn list_services(&self) -> DiscoveryResult<HashMap<String, Vec<String>>>;

    /// Resolve one healthy instance of a service, returning its port and
    /// the datacenter it is registered in.
    async fn healthy_instance(&self, name: &str) -> DiscoveryResult<(u16, String)>;
}

#[derive(Debug, Deserialize)]
struct ConsulCatalogService {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    #[serde(rename = "ServicePort")]
    service_port: u16,
    #[serde(rename = "ServiceTags", default)]
    service_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulHealthNode,
    #[serde(rename = "Service")]
    service: ConsulHealthService,
}

#[derive(Debug, Deserialize)]
struct ConsulHealthNode {
    #[serde(rename = "Datacenter", default)]
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct ConsulHealthService {
    #[serde(rename = "Port")]
    port: u16,
}

/// Consul HTTP API client.
pub struct ConsulRegistry {
    http: reqwest::Client,
    base: String,
}

impl ConsulRegistry {
    /// Create a client for a Consul agent at `host:port`.
    pub fn new(address: &str) -> DiscoveryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: format!("http://{address}/v1"),
        })
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn resolve_service(&self, name: &str) -> DiscoveryResult<Vec<CatalogEntry>> {
        let url = format!("{}/catalog/service/{name}?stale", self.base);
        let services: Vec<ConsulCatalogService> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(service = name, entries = services.len(), "catalog resolved");
        Ok(services
            .into_iter()
            .map(|s| CatalogEntry {
                node: s.node,
                address: s.address,
                service_address: s.service_address,
                service_port: s.service_port,
                service_tags: s.service_tags,
            })
            .collect())
    }

    async fn list_services(&self) -> DiscoveryResult<HashMap<String, Vec<String>>> {
        let url = format!("{}/catalog/services?stale", self.base);
        let services: HashMap<String, Vec<String>> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(services)
    }

    async fn healthy_instance(&self, name: &str) -> DiscoveryResult<(u16, String)> {
        let url = format!("{}/health/service/{name}?stale", self.base);
        let entries: Vec<ConsulHealthEntry> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let first = entries
            .first()
            .ok_or_else(|| DiscoveryError::NoHealthyInstance(name.to_string()))?;
        Ok((first.service.port, first.node.datacenter.clone()))
    }
}
