//! Elasticsearch/OpenSearch probe state machine.
//!
//! One instance per monitored cluster. The run loop services exactly one
//! timer branch per wakeup; work inside a branch fans out into concurrent
//! tasks that are joined before the branch returns, so a slow node or a
//! failed sub-step never corrupts the scheduling of sibling checks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use sonde_discovery::{discover_nodes, Cluster, KnownNodes, Node, ServiceRegistry};
use sonde_metrics::{NodeKind, SondeMetrics};

use crate::client::{EsClient, EsDocument, SearchApiFlavor};
use crate::config::SondeConfig;
use crate::error::{ProbeError, ProbeResult};
use crate::restore;

/// Clusters below this major version never run the restore probe.
pub(crate) const RESTORE_MIN_MAJOR: u32 = 7;

/// Compute the document ids missing from the durability population.
///
/// Ids are a dense `1..=target` sequence; with `current` documents
/// present the gap is exactly `[current+1, target+1)`, so one pass
/// brings the population to `max(current, target)` and a second pass
/// writes nothing.
pub(crate) fn missing_document_ids(current: u64, target: u64) -> std::ops::Range<u64> {
    (current + 1)..(target + 1)
}

fn health_ordinal(status: &str) -> f64 {
    match status {
        "green" => 0.0,
        "yellow" => 1.0,
        _ => 2.0,
    }
}

fn probe_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Probe one node's lightweight health endpoint; returns the observed
/// latency in milliseconds.
async fn probe_node(
    http: &reqwest::Client,
    node: &Node,
    username: Option<&str>,
    password: Option<&str>,
) -> ProbeResult<f64> {
    let url = format!("{}://{}:{}/_cat/health?v", node.scheme, node.address, node.port);
    let mut req = http.get(&url);
    if let Some(user) = username {
        req = req.basic_auth(user, password);
    }

    let start = Instant::now();
    let resp = req.send().await?;
    let millis = start.elapsed().as_secs_f64() * 1000.0;

    if !resp.status().is_success() {
        return Err(ProbeError::Status {
            operation: "cat health",
            target: url,
            status: resp.status().as_u16(),
        });
    }
    Ok(millis)
}

/// The full-featured probe for one Elasticsearch/OpenSearch cluster.
pub struct EsProbe {
    cluster_name: String,
    cluster: Cluster,
    config: SondeConfig,
    registry: Arc<dyn ServiceRegistry>,
    metrics: Arc<SondeMetrics>,
    client: EsClient,
    /// Separate client for node-level probes (per-node URLs).
    node_http: reqwest::Client,
    flavor: SearchApiFlavor,
    nodes: Vec<Node>,
    known: KnownNodes,
}

impl EsProbe {
    /// First half of initialization: bootstrap discovery and client
    /// construction. A discovery failure here is fatal to this instance
    /// only; the watcher must not register it.
    pub async fn new(
        cluster_name: String,
        endpoint: String,
        cluster: Cluster,
        config: SondeConfig,
        registry: Arc<dyn ServiceRegistry>,
        metrics: Arc<SondeMetrics>,
    ) -> ProbeResult<Self> {
        let nodes = discover_nodes(registry.as_ref(), &cluster.service).await?;
        let mut known = KnownNodes::new();
        known.update(&nodes);

        let client = EsClient::new(
            &cluster.scheme,
            &endpoint,
            config.elasticsearch_user.clone(),
            config.elasticsearch_password.clone(),
            config.probe_timeout(),
        )?;
        let node_http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .danger_accept_invalid_certs(true)
            .build()?;
        let flavor = SearchApiFlavor::from_major(cluster.major_version());

        Ok(Self {
            cluster_name,
            cluster,
            config,
            registry,
            metrics,
            client,
            node_http,
            flavor,
            nodes,
            known,
        })
    }

    /// Second half of initialization: make sure the probe fixtures exist.
    ///
    /// Creates the durability and latency indices if missing and fills
    /// the durability population up to its target. Idempotent.
    pub async fn prepare(&self) -> ProbeResult<()> {
        self.client.ensure_index(&self.config.durability_index).await?;
        self.client.ensure_index(&self.config.latency_index).await?;

        let current = self
            .client
            .count_documents(&self.config.durability_index)
            .await?;
        self.replenish_durability_documents(current).await
    }

    /// The `Running` loop. Returns once the shutdown signal is observed
    /// and draining is complete.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut discovery = probe_interval(self.config.consul_period);
        let mut node_probing = probe_interval(self.config.probe_period);
        let mut durability = probe_interval(self.config.probe_period);
        let mut latency = probe_interval(self.config.latency_probe_period());
        let mut restoring = probe_interval(self.config.restore_period);
        let mut pruning = probe_interval(self.config.cleaning_period);

        // The gate cannot change while the instance lives: both the flag
        // and the advertised version are fixed at creation.
        let restore_allowed = self.restore_allowed();
        if self.config.restore_enabled && !restore_allowed {
            info!(
                cluster = %self.cluster_name,
                version = %self.cluster.version,
                "restore probing disabled for this cluster version"
            );
        }

        info!(cluster = %self.cluster_name, "es probe running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.drain();
                    return;
                }
                _ = discovery.tick() => self.refresh_nodes().await,
                _ = node_probing.tick() => self.probe_nodes().await,
                _ = durability.tick() => self.probe_durability().await,
                _ = latency.tick() => self.probe_latency().await,
                _ = restoring.tick(), if restore_allowed => self.probe_restore().await,
                _ = pruning.tick() => self.prune_metrics(),
            }
        }
    }

    fn restore_allowed(&self) -> bool {
        restore::restore_gate(self.config.restore_enabled, self.cluster.major_version())
    }

    // ── Discovery refresh ──────────────────────────────────────

    async fn refresh_nodes(&mut self) {
        debug!(cluster = %self.cluster_name, "refreshing node list");
        match discover_nodes(self.registry.as_ref(), &self.cluster.service).await {
            Ok(nodes) => {
                self.known.update(&nodes);
                info!(cluster = %self.cluster_name, nodes = nodes.len(), "node list updated");
                self.nodes = nodes;
            }
            Err(e) => {
                // Stale-but-available beats empty: keep the last list.
                error!(cluster = %self.cluster_name, error = %e, "node refresh failed, keeping last known list");
                self.metrics.inc_internal_errors();
            }
        }
    }

    // ── Node availability ──────────────────────────────────────

    async fn probe_nodes(&self) {
        debug!(cluster = %self.cluster_name, nodes = self.nodes.len(), "probing nodes");
        let mut handles = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.clone() {
            let http = self.node_http.clone();
            let metrics = self.metrics.clone();
            let cluster_name = self.cluster_name.clone();
            let username = self.config.elasticsearch_user.clone();
            let password = self.config.elasticsearch_password.clone();

            handles.push(tokio::spawn(async move {
                match probe_node(&http, &node, username.as_deref(), password.as_deref()).await {
                    Ok(millis) => {
                        metrics.set_node_availability(
                            NodeKind::Elasticsearch,
                            &node.cluster,
                            &node.name,
                            true,
                        );
                        metrics.observe_node_latency(&node.cluster, &node.name, millis);
                    }
                    Err(e) => {
                        error!(cluster = %cluster_name, node = %node.name, error = %e, "node probe failed");
                        metrics.set_node_availability(
                            NodeKind::Elasticsearch,
                            &node.cluster,
                            &node.name,
                            false,
                        );
                        metrics.inc_cluster_errors(&cluster_name);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ── Durability ─────────────────────────────────────────────

    async fn probe_durability(&self) {
        debug!(cluster = %self.cluster_name, "probing durability");
        tokio::join!(
            self.check_index_status(&self.config.durability_index),
            self.check_durability_documents(),
        );
    }

    async fn check_index_status(&self, index: &str) {
        match self.client.index_health(index).await {
            Ok(status) => {
                self.metrics
                    .set_index_status(&self.cluster_name, index, health_ordinal(&status));
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, error = %e, "index status check failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }
    }

    async fn check_durability_documents(&self) {
        let index = &self.config.durability_index;

        let start = Instant::now();
        match self.client.count_documents(index).await {
            Ok(count) => {
                let millis = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .observe_operation_latency(&self.cluster_name, index, "count", millis);
                self.metrics
                    .set_durability_documents(&self.cluster_name, count as f64);

                if count < self.config.durability_documents_target {
                    if let Err(e) = self.replenish_durability_documents(count).await {
                        error!(cluster = %self.cluster_name, index = %index, error = %e, "durability replenishment failed");
                        self.metrics.inc_cluster_errors(&self.cluster_name);
                    }
                }
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, error = %e, "durability count failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }

        let start = Instant::now();
        match self.client.search_range(index, self.flavor).await {
            Ok(hits) => {
                let millis = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .observe_operation_latency(&self.cluster_name, index, "search", millis);
                self.metrics
                    .set_durability_search_hits(&self.cluster_name, index, hits as f64);
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, error = %e, "durability search failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }
    }

    async fn replenish_durability_documents(&self, current: u64) -> ProbeResult<()> {
        let target = self.config.durability_documents_target;
        let missing = missing_document_ids(current, target);
        if missing.is_empty() {
            return Ok(());
        }
        info!(
            cluster = %self.cluster_name,
            current,
            target,
            "replenishing durability documents"
        );
        for i in missing {
            let doc = EsDocument::durability(i);
            self.client
                .index_document(&self.config.durability_index, &i.to_string(), &doc)
                .await?;
        }
        Ok(())
    }

    // ── Operation latency ──────────────────────────────────────

    async fn probe_latency(&self) {
        debug!(cluster = %self.cluster_name, "probing latency");
        tokio::join!(
            self.check_index_status(&self.config.latency_index),
            self.latency_round_trip(),
        );
    }

    /// Index, read back and delete one uniquely-identified document,
    /// timing each operation separately. A failed step is logged and
    /// counted but the remaining steps still run: a leaked document is
    /// idle data, not a reason to skip the delete measurement.
    async fn latency_round_trip(&self) {
        let index = &self.config.latency_index;
        let document_id = format!("search-document-{}", Uuid::new_v4());
        let doc = EsDocument::latency(&document_id);

        let start = Instant::now();
        match self.client.index_document(index, &document_id, &doc).await {
            Ok(()) => {
                let millis = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .observe_operation_latency(&self.cluster_name, index, "index", millis);
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, document_id = %document_id, error = %e, "latency index failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }

        let start = Instant::now();
        match self.client.get_document(index, &document_id).await {
            Ok(()) => {
                let millis = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .observe_operation_latency(&self.cluster_name, index, "get", millis);
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, document_id = %document_id, error = %e, "latency get failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }

        let start = Instant::now();
        match self.client.delete_document(index, &document_id).await {
            Ok(()) => {
                let millis = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .observe_operation_latency(&self.cluster_name, index, "delete", millis);
            }
            Err(e) => {
                error!(cluster = %self.cluster_name, index = %index, document_id = %document_id, error = %e, "latency delete failed");
                self.metrics.inc_cluster_errors(&self.cluster_name);
            }
        }
    }

    // ── Restore ────────────────────────────────────────────────

    async fn probe_restore(&self) {
        info!(cluster = %self.cluster_name, "probing snapshot restore");
        if let Err(e) = restore::run_restore(
            &self.client,
            &self.config,
            &self.metrics,
            &self.cluster_name,
        )
        .await
        {
            error!(cluster = %self.cluster_name, error = %e, "restore probe failed");
            self.metrics.inc_restore_errors(&self.cluster_name);
        }
    }

    // ── Pruning & draining ─────────────────────────────────────

    fn prune_metrics(&self) {
        debug!(cluster = %self.cluster_name, "pruning metrics for vanished nodes");
        self.metrics.prune_node_series(&self.known, &self.nodes);
    }

    /// Final cleanup once shutdown is observed: retract every node
    /// series ever emitted and the cluster-level series.
    fn drain(&self) {
        info!(cluster = %self.cluster_name, "terminating es probe");
        self.metrics.prune_node_series(&self.known, &[]);
        let restored = self.config.restored_index();
        self.metrics.remove_cluster_series(
            &self.cluster_name,
            &[
                self.config.durability_index.as_str(),
                self.config.latency_index.as_str(),
                restored.as_str(),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use async_trait::async_trait;
    use prometheus::Registry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use sonde_discovery::{CatalogEntry, DiscoveryError, DiscoveryResult};

    struct NoopRegistry;

    #[async_trait]
    impl ServiceRegistry for NoopRegistry {
        async fn resolve_service(&self, _name: &str) -> DiscoveryResult<Vec<CatalogEntry>> {
            Ok(Vec::new())
        }

        async fn list_services(&self) -> DiscoveryResult<HashMap<String, Vec<String>>> {
            Ok(HashMap::new())
        }

        async fn healthy_instance(&self, name: &str) -> DiscoveryResult<(u16, String)> {
            Err(DiscoveryError::NoHealthyInstance(name.to_string()))
        }
    }

    /// Minimal HTTP listener answering every connection with `status_line`
    /// and an empty body; returns the bound port.
    async fn spawn_http_node(status_line: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response =
                    format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn local_node(name: &str, port: u16) -> Node {
        Node {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            cluster: "c1".to_string(),
            scheme: "http".to_string(),
        }
    }

    fn test_probe(nodes: Vec<Node>, metrics: Arc<SondeMetrics>) -> EsProbe {
        EsProbe {
            cluster_name: "c1".to_string(),
            cluster: Cluster {
                service: "svc".to_string(),
                scheme: "http".to_string(),
                version: "7.10.0".to_string(),
            },
            config: SondeConfig::default(),
            registry: Arc::new(NoopRegistry),
            metrics,
            client: EsClient::new("http", "127.0.0.1:1", None, None, Duration::from_secs(1))
                .unwrap(),
            node_http: reqwest::Client::new(),
            flavor: SearchApiFlavor::Modern,
            nodes,
            known: KnownNodes::new(),
        }
    }

    #[tokio::test]
    async fn one_failing_node_does_not_taint_the_others() {
        let mut nodes = Vec::new();
        for i in 0..4 {
            let port = spawn_http_node("HTTP/1.1 200 OK").await;
            nodes.push(local_node(&format!("up-{i}"), port));
        }
        let port = spawn_http_node("HTTP/1.1 500 Internal Server Error").await;
        nodes.push(local_node("down", port));

        let metrics = Arc::new(SondeMetrics::register(&Registry::new()).unwrap());
        let probe = test_probe(nodes, metrics.clone());
        probe.probe_nodes().await;

        let rendered = metrics.render();
        for i in 0..4 {
            assert!(
                rendered.contains(&format!("node_name=\"up-{i}\"}} 1")),
                "node up-{i} must still report available:\n{rendered}"
            );
        }
        assert!(
            rendered.contains("node_name=\"down\"} 0"),
            "failing node must report unavailable:\n{rendered}"
        );
    }

    #[tokio::test]
    async fn unreachable_node_reports_unavailable() {
        // Bind then drop, so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let metrics = Arc::new(SondeMetrics::register(&Registry::new()).unwrap());
        let probe = test_probe(vec![local_node("gone", port)], metrics.clone());
        probe.probe_nodes().await;

        assert!(metrics.render().contains("node_name=\"gone\"} 0"));
    }

    #[test]
    fn missing_ids_fill_the_gap_exactly() {
        // 40 documents present, 100 wanted: ids 41..=100 are written.
        let ids: Vec<u64> = missing_document_ids(40, 100).collect();
        assert_eq!(ids.first(), Some(&41));
        assert_eq!(ids.last(), Some(&100));
        assert_eq!(ids.len(), 60);
    }

    #[test]
    fn missing_ids_is_empty_at_or_above_target() {
        assert!(missing_document_ids(100, 100).next().is_none());
        assert!(missing_document_ids(150, 100).next().is_none());
    }

    #[test]
    fn missing_ids_from_empty_index() {
        let ids: Vec<u64> = missing_document_ids(0, 3).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn health_ordinal_mapping() {
        assert_eq!(health_ordinal("green"), 0.0);
        assert_eq!(health_ordinal("yellow"), 1.0);
        assert_eq!(health_ordinal("red"), 2.0);
        assert_eq!(health_ordinal("weird"), 2.0);
    }
}
