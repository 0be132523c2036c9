//! Known-node bookkeeping.
//!
//! Each probe instance remembers every `(name, cluster)` identity it has
//! ever observed, so that metric series for vanished nodes can be
//! retracted. The set grows monotonically for the lifetime of the probe;
//! node churn is low enough that the unbounded growth is an accepted
//! trade-off.

use std::collections::BTreeSet;

use crate::discover::Node;

/// Identity of a monitored node: `(name, cluster)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId {
    pub name: String,
    pub cluster: String,
}

impl NodeId {
    pub fn of(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            cluster: node.cluster.clone(),
        }
    }
}

/// The set of node identities ever seen by one probe instance.
///
/// Backed by a `BTreeSet` so iteration order is canonical, which keeps
/// metric retraction deterministic.
#[derive(Debug, Default)]
pub struct KnownNodes {
    nodes: BTreeSet<NodeId>,
}

impl KnownNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every identity present in `current`; never removes anything.
    pub fn update(&mut self, current: &[Node]) {
        for node in current {
            self.nodes.insert(NodeId::of(node));
        }
    }

    /// Identities that were seen before but are absent from `current`.
    ///
    /// These are the retraction candidates: a node only loses its metric
    /// series after it has left the live list, never speculatively.
    pub fn vanished(&self, current: &[Node]) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|id| {
                !current
                    .iter()
                    .any(|n| n.name == id.name && n.cluster == id.cluster)
            })
            .collect()
    }

    /// Iterate all known identities in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
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

    #[test]
    fn update_accumulates_union_of_all_refreshes() {
        let mut known = KnownNodes::new();
        known.update(&[node("a", "c1"), node("b", "c1")]);
        known.update(&[node("b", "c1"), node("c", "c1")]);
        known.update(&[]);

        let names: Vec<&str> = known.iter().map(|id| id.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn iteration_is_sorted() {
        let mut known = KnownNodes::new();
        known.update(&[node("z", "c1"), node("a", "c2"), node("a", "c1")]);
        let ids: Vec<(String, String)> = known
            .iter()
            .map(|id| (id.name.clone(), id.cluster.clone()))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn vanished_reports_only_missing_identities() {
        let mut known = KnownNodes::new();
        known.update(&[node("a", "c1"), node("b", "c1")]);

        let current = vec![node("b", "c1")];
        let gone = known.vanished(&current);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].name, "a");

        // Same name in a different cluster is a different identity.
        let other_cluster = vec![node("a", "c2"), node("b", "c1")];
        let gone = known.vanished(&other_cluster);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].cluster, "c1");
    }

    #[test]
    fn vanished_against_empty_list_is_everything() {
        let mut known = KnownNodes::new();
        known.update(&[node("a", "c1"), node("b", "c1")]);
        assert_eq!(known.vanished(&[]).len(), 2);
    }
}
