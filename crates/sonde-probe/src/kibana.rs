//! Kibana probe — the read-only-health flavor of the state machine.
//!
//! Same lifecycle as the Elasticsearch probe but only three loops:
//! discovery refresh, node availability and metric pruning. A node is
//! available only when its status endpoint answers 200 *and* reports an
//! overall green state in the body.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use sonde_discovery::{discover_nodes, Cluster, KnownNodes, Node, ServiceRegistry};
use sonde_metrics::{NodeKind, SondeMetrics};

use crate::config::SondeConfig;
use crate::error::{ProbeError, ProbeResult};

#[derive(Debug, Deserialize)]
struct KibanaStatusResponse {
    status: KibanaStatus,
}

#[derive(Debug, Deserialize)]
struct KibanaStatus {
    overall: KibanaOverall,
}

#[derive(Debug, Deserialize)]
struct KibanaOverall {
    state: String,
}

async fn probe_node(http: &reqwest::Client, node: &Node) -> ProbeResult<()> {
    let url = format!("{}://{}:{}/api/status", node.scheme, node.address, node.port);
    let resp = http.get(&url).send().await?;

    if !resp.status().is_success() {
        return Err(ProbeError::Status {
            operation: "kibana status",
            target: url,
            status: resp.status().as_u16(),
        });
    }

    let body: KibanaStatusResponse = resp.json().await.map_err(|e| ProbeError::Shape {
        operation: "kibana status",
        target: url.clone(),
        message: e.to_string(),
    })?;

    if body.status.overall.state != "green" {
        return Err(ProbeError::Shape {
            operation: "kibana status",
            target: url,
            message: format!("node state is {:?}, not green", body.status.overall.state),
        });
    }
    Ok(())
}

fn probe_interval(period: std::time::Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Availability probe for one Kibana cluster.
pub struct KibanaProbe {
    cluster_name: String,
    cluster: Cluster,
    config: SondeConfig,
    registry: Arc<dyn ServiceRegistry>,
    metrics: Arc<SondeMetrics>,
    http: reqwest::Client,
    nodes: Vec<Node>,
    known: KnownNodes,
}

impl KibanaProbe {
    /// Bootstrap discovery; failure is fatal to this instance only.
    pub async fn new(
        cluster_name: String,
        cluster: Cluster,
        config: SondeConfig,
        registry: Arc<dyn ServiceRegistry>,
        metrics: Arc<SondeMetrics>,
    ) -> ProbeResult<Self> {
        let nodes = discover_nodes(registry.as_ref(), &cluster.service).await?;
        let mut known = KnownNodes::new();
        known.update(&nodes);

        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            cluster_name,
            cluster,
            config,
            registry,
            metrics,
            http,
            nodes,
            known,
        })
    }

    /// The `Running` loop; returns after draining on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut discovery = probe_interval(self.config.consul_period);
        let mut node_probing = probe_interval(self.config.probe_period);
        let mut pruning = probe_interval(self.config.cleaning_period);

        info!(cluster = %self.cluster_name, "kibana probe running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(cluster = %self.cluster_name, "terminating kibana probe");
                    self.metrics.prune_node_series(&self.known, &[]);
                    return;
                }
                _ = discovery.tick() => self.refresh_nodes().await,
                _ = node_probing.tick() => self.probe_nodes().await,
                _ = pruning.tick() => {
                    debug!(cluster = %self.cluster_name, "pruning metrics for vanished nodes");
                    self.metrics.prune_node_series(&self.known, &self.nodes);
                }
            }
        }
    }

    async fn refresh_nodes(&mut self) {
        debug!(cluster = %self.cluster_name, "refreshing kibana node list");
        match discover_nodes(self.registry.as_ref(), &self.cluster.service).await {
            Ok(nodes) => {
                self.known.update(&nodes);
                info!(cluster = %self.cluster_name, nodes = nodes.len(), "kibana node list updated");
                self.nodes = nodes;
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, error = %e, "kibana node refresh failed, keeping last known list");
                self.metrics.inc_internal_errors();
            }
        }
    }

    async fn probe_nodes(&self) {
        debug!(cluster = %self.cluster_name, nodes = self.nodes.len(), "probing kibana nodes");
        let mut handles = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.clone() {
            let http = self.http.clone();
            let metrics = self.metrics.clone();
            let cluster_name = self.cluster_name.clone();

            handles.push(tokio::spawn(async move {
                match probe_node(&http, &node).await {
                    Ok(()) => {
                        metrics.set_node_availability(
                            NodeKind::Kibana,
                            &node.cluster,
                            &node.name,
                            true,
                        );
                    }
                    Err(e) => {
                        error!(cluster = %cluster_name, node = %node.name, error = %e, "kibana probe failed");
                        metrics.set_node_availability(
                            NodeKind::Kibana,
                            &node.cluster,
                            &node.name,
                            false,
                        );
                        metrics.inc_internal_errors();
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal status endpoint answering one connection with 200 and `body`.
    async fn spawn_status_node(body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn local_node(port: u16) -> Node {
        Node {
            name: "kb-1".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            cluster: "c1".to_string(),
            scheme: "http".to_string(),
        }
    }

    #[tokio::test]
    async fn green_state_is_available() {
        let port = spawn_status_node(r#"{"status":{"overall":{"state":"green"}}}"#).await;
        let http = reqwest::Client::new();
        assert!(probe_node(&http, &local_node(port)).await.is_ok());
    }

    #[tokio::test]
    async fn non_green_state_is_unavailable_despite_http_200() {
        let port = spawn_status_node(r#"{"status":{"overall":{"state":"red"}}}"#).await;
        let http = reqwest::Client::new();
        let err = probe_node(&http, &local_node(port)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Shape { .. }));
    }
}
