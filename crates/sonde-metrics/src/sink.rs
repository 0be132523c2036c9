//! Prometheus metric families and their retraction paths.

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use tracing::{debug, info};

use sonde_discovery::{KnownNodes, Node};

/// Latency bucket ladder, in milliseconds.
const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 2.5, 5.0, 7.5, 10.0, 15.0, 20.0, 35.0, 50.0, 75.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
    10000.0,
];

/// Operation labels used by the per-operation latency families.
pub const OPERATIONS: &[&str] = &["count", "index", "get", "search", "delete"];

/// Which availability family a node reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Elasticsearch,
    Kibana,
}

/// All metric families emitted by the probes.
///
/// Registered once against an externally owned registry; cloneable
/// handles inside the prometheus vecs make this cheap to share via `Arc`.
pub struct SondeMetrics {
    registry: Registry,

    node_availability: GaugeVec,
    kibana_node_availability: GaugeVec,
    node_cat_latency: HistogramVec,

    index_probe_status: GaugeVec,
    durability_documents: GaugeVec,
    durability_search_hits: GaugeVec,
    restore_documents: GaugeVec,
    restore_count: GaugeVec,
    operation_latency: HistogramVec,

    errors_total: IntCounter,
    cluster_errors: CounterVec,
    restore_errors: CounterVec,
}

impl SondeMetrics {
    /// Build and register every family against `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let node_availability = GaugeVec::new(
            Opts::new(
                "es_node_availability",
                "Elasticsearch node availability: 1 is OK, 0 means node unavailable",
            ),
            &["cluster", "node_name"],
        )?;
        let kibana_node_availability = GaugeVec::new(
            Opts::new(
                "kibana_node_availability",
                "Kibana node availability: 1 is OK, 0 means node unavailable",
            ),
            &["cluster", "node_name"],
        )?;
        let node_cat_latency = HistogramVec::new(
            HistogramOpts::new(
                "es_node_cat_latency_ms",
                "Latency of the node-level cat health probe",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["cluster", "node_name"],
        )?;
        let index_probe_status = GaugeVec::new(
            Opts::new(
                "es_index_probe_status",
                "Index probe status (green is 0, yellow is 1 and red is 2)",
            ),
            &["cluster", "index"],
        )?;
        let durability_documents = GaugeVec::new(
            Opts::new(
                "es_cluster_durability_documents_count",
                "Number of documents counted in the durability index",
            ),
            &["cluster"],
        )?;
        let durability_search_hits = GaugeVec::new(
            Opts::new(
                "es_cluster_durability_search_documents_hits",
                "Document hits from the range search on the durability index",
            ),
            &["cluster", "index"],
        )?;
        let restore_documents = GaugeVec::new(
            Opts::new(
                "es_cluster_restore_documents_count",
                "Number of documents counted in the restored index",
            ),
            &["cluster"],
        )?;
        let restore_count = GaugeVec::new(
            Opts::new("es_cluster_restore_count", "Number of restores launched"),
            &["cluster"],
        )?;
        let operation_latency = HistogramVec::new(
            HistogramOpts::new(
                "es_cluster_latency_ms",
                "Latency of cluster-level probe operations",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["cluster", "index", "operation"],
        )?;
        let errors_total = IntCounter::new(
            "es_probe_errors_count",
            "Internal probe errors, absolute counter since start",
        )?;
        let cluster_errors = CounterVec::new(
            Opts::new(
                "es_cluster_errors_count",
                "Errors encountered while probing a cluster",
            ),
            &["cluster"],
        )?;
        let restore_errors = CounterVec::new(
            Opts::new(
                "es_cluster_restore_errors_count",
                "Errors encountered during the restore pipeline",
            ),
            &["cluster"],
        )?;

        registry.register(Box::new(node_availability.clone()))?;
        registry.register(Box::new(kibana_node_availability.clone()))?;
        registry.register(Box::new(node_cat_latency.clone()))?;
        registry.register(Box::new(index_probe_status.clone()))?;
        registry.register(Box::new(durability_documents.clone()))?;
        registry.register(Box::new(durability_search_hits.clone()))?;
        registry.register(Box::new(restore_documents.clone()))?;
        registry.register(Box::new(restore_count.clone()))?;
        registry.register(Box::new(operation_latency.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(cluster_errors.clone()))?;
        registry.register(Box::new(restore_errors.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            node_availability,
            kibana_node_availability,
            node_cat_latency,
            index_probe_status,
            durability_documents,
            durability_search_hits,
            restore_documents,
            restore_count,
            operation_latency,
            errors_total,
            cluster_errors,
            restore_errors,
        })
    }

    // ── Emission ───────────────────────────────────────────────

    pub fn set_node_availability(&self, kind: NodeKind, cluster: &str, node: &str, up: bool) {
        let value = if up { 1.0 } else { 0.0 };
        let gauge = match kind {
            NodeKind::Elasticsearch => &self.node_availability,
            NodeKind::Kibana => &self.kibana_node_availability,
        };
        gauge.with_label_values(&[cluster, node]).set(value);
    }

    pub fn observe_node_latency(&self, cluster: &str, node: &str, millis: f64) {
        self.node_cat_latency
            .with_label_values(&[cluster, node])
            .observe(millis);
    }

    pub fn set_index_status(&self, cluster: &str, index: &str, ordinal: f64) {
        self.index_probe_status
            .with_label_values(&[cluster, index])
            .set(ordinal);
    }

    pub fn set_durability_documents(&self, cluster: &str, count: f64) {
        self.durability_documents
            .with_label_values(&[cluster])
            .set(count);
    }

    pub fn set_durability_search_hits(&self, cluster: &str, index: &str, hits: f64) {
        self.durability_search_hits
            .with_label_values(&[cluster, index])
            .set(hits);
    }

    pub fn set_restore_documents(&self, cluster: &str, count: f64) {
        self.restore_documents
            .with_label_values(&[cluster])
            .set(count);
    }

    pub fn inc_restore_count(&self, cluster: &str) {
        self.restore_count.with_label_values(&[cluster]).inc();
    }

    pub fn observe_operation_latency(&self, cluster: &str, index: &str, operation: &str, millis: f64) {
        self.operation_latency
            .with_label_values(&[cluster, index, operation])
            .observe(millis);
    }

    pub fn inc_internal_errors(&self) {
        self.errors_total.inc();
    }

    pub fn inc_cluster_errors(&self, cluster: &str) {
        self.cluster_errors.with_label_values(&[cluster]).inc();
    }

    pub fn inc_restore_errors(&self, cluster: &str) {
        self.restore_errors.with_label_values(&[cluster]).inc();
    }

    // ── Retraction ─────────────────────────────────────────────

    /// Delete every node-level series for `(cluster, node)`.
    ///
    /// Returns true when at least one series actually existed; deleting
    /// an already-retracted identity is a no-op.
    pub fn remove_node_series(&self, cluster: &str, node: &str) -> bool {
        let labels = [cluster, node];
        let mut removed = false;
        removed |= self.node_availability.remove_label_values(&labels).is_ok();
        removed |= self
            .kibana_node_availability
            .remove_label_values(&labels)
            .is_ok();
        removed |= self.node_cat_latency.remove_label_values(&labels).is_ok();
        removed
    }

    /// Retract series for every known identity absent from `current`.
    ///
    /// Returns the number of identities whose series were actually
    /// removed, so a second pass with an unchanged `current` reports zero.
    pub fn prune_node_series(&self, known: &KnownNodes, current: &[Node]) -> usize {
        let mut removed = 0;
        for id in known.vanished(current) {
            if self.remove_node_series(&id.cluster, &id.name) {
                info!(node = %id.name, cluster = %id.cluster, "metrics removed for vanished node");
                removed += 1;
            } else {
                debug!(node = %id.name, cluster = %id.cluster, "no live series for vanished node");
            }
        }
        removed
    }

    /// Delete every cluster-level series for `cluster` and its probe
    /// indices. Used when a cluster disappears from the registry.
    pub fn remove_cluster_series(&self, cluster: &str, indices: &[&str]) {
        let labels = [cluster];
        let _ = self.durability_documents.remove_label_values(&labels);
        let _ = self.restore_documents.remove_label_values(&labels);
        let _ = self.restore_count.remove_label_values(&labels);
        let _ = self.cluster_errors.remove_label_values(&labels);
        let _ = self.restore_errors.remove_label_values(&labels);

        for &index in indices {
            let _ = self
                .index_probe_status
                .remove_label_values(&[cluster, index]);
            let _ = self
                .durability_search_hits
                .remove_label_values(&[cluster, index]);
            for &operation in OPERATIONS {
                let _ = self
                    .operation_latency
                    .remove_label_values(&[cluster, index, operation]);
            }
        }
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, cluster: &str) -> Node {
        Node {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 9200,
            cluster: cluster.to_string(),
            scheme: "http".to_string(),
        }
    }

    fn metrics() -> SondeMetrics {
        SondeMetrics::register(&Registry::new()).unwrap()
    }

    #[test]
    fn prune_removes_only_vanished_nodes() {
        let m = metrics();
        let nodes = vec![node("a", "c1"), node("b", "c1")];
        for n in &nodes {
            m.set_node_availability(NodeKind::Elasticsearch, &n.cluster, &n.name, true);
        }

        let mut known = KnownNodes::new();
        known.update(&nodes);

        let current = vec![node("b", "c1")];
        assert_eq!(m.prune_node_series(&known, &current), 1);

        let rendered = m.render();
        assert!(!rendered.contains("node_name=\"a\""));
        assert!(rendered.contains("node_name=\"b\""));
    }

    #[test]
    fn prune_is_idempotent() {
        let m = metrics();
        let nodes = vec![node("a", "c1"), node("b", "c1")];
        for n in &nodes {
            m.set_node_availability(NodeKind::Elasticsearch, &n.cluster, &n.name, true);
        }

        let mut known = KnownNodes::new();
        known.update(&nodes);

        let current = vec![node("b", "c1")];
        assert_eq!(m.prune_node_series(&known, &current), 1);
        assert_eq!(m.prune_node_series(&known, &current), 0);
    }

    #[test]
    fn prune_keeps_live_nodes_untouched() {
        let m = metrics();
        let nodes = vec![node("a", "c1")];
        m.set_node_availability(NodeKind::Elasticsearch, "c1", "a", true);

        let mut known = KnownNodes::new();
        known.update(&nodes);

        assert_eq!(m.prune_node_series(&known, &nodes), 0);
        assert!(m.render().contains("node_name=\"a\""));
    }

    #[test]
    fn cluster_series_are_removed_for_every_index_and_operation() {
        let m = metrics();
        m.set_durability_documents("c1", 100.0);
        m.set_index_status("c1", "idx", 0.0);
        m.set_durability_search_hits("c1", "idx", 71.0);
        for &op in OPERATIONS {
            m.observe_operation_latency("c1", "idx", op, 5.0);
        }
        m.inc_cluster_errors("c1");

        m.remove_cluster_series("c1", &["idx"]);
        let rendered = m.render();
        assert!(!rendered.contains("cluster=\"c1\""));
    }

    #[test]
    fn availability_gauge_values() {
        let m = metrics();
        m.set_node_availability(NodeKind::Kibana, "c1", "a", false);
        let rendered = m.render();
        assert!(rendered.contains("kibana_node_availability{cluster=\"c1\",node_name=\"a\"} 0"));
    }
}
