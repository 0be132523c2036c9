//! The reconciliation loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use sonde_discovery::{cluster_endpoint, discover_clusters, Cluster, ServiceRegistry};
use sonde_metrics::SondeMetrics;
use sonde_probe::{EsProbe, KibanaProbe, ProbeError, SondeConfig};

/// A running probe instance: its one-shot shutdown signal plus the task
/// handle. Removal sends the signal, then awaits the task so metric
/// retraction has finished before the reconciliation pass continues.
struct ProbeHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Compute `to_add = discovered \ running` and `to_remove = running \
/// discovered`, by cluster name. Sorted for deterministic processing.
fn diff_clusters<V, W>(
    discovered: &HashMap<String, V>,
    running: &HashMap<String, W>,
) -> (Vec<String>, Vec<String>) {
    let mut to_add: Vec<String> = discovered
        .keys()
        .filter(|name| !running.contains_key(*name))
        .cloned()
        .collect();
    let mut to_remove: Vec<String> = running
        .keys()
        .filter(|name| !discovered.contains_key(*name))
        .cloned()
        .collect();
    to_add.sort();
    to_remove.sort();
    (to_add, to_remove)
}

/// Keeps the pool of probe instances in sync with the registry.
pub struct Watcher {
    config: SondeConfig,
    registry: Arc<dyn ServiceRegistry>,
    metrics: Arc<SondeMetrics>,

    es_probes: HashMap<String, ProbeHandle>,
    kibana_probes: HashMap<String, ProbeHandle>,
}

impl Watcher {
    pub fn new(
        config: SondeConfig,
        registry: Arc<dyn ServiceRegistry>,
        metrics: Arc<SondeMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            es_probes: HashMap::new(),
            kibana_probes: HashMap::new(),
        }
    }

    /// Poll the registry and reconcile forever.
    pub async fn watch_forever(mut self) {
        info!(
            es_tag = %self.config.elasticsearch_consul_tag,
            kibana_tag = %self.config.kibana_consul_tag,
            "entering watch loop"
        );
        loop {
            self.reconcile_once().await;
            tokio::time::sleep(self.config.consul_period).await;
        }
    }

    /// One reconciliation pass over both monitored flavors.
    ///
    /// A discovery failure for one flavor is logged and counted; the
    /// pass still handles the other flavor and the loop keeps running.
    pub async fn reconcile_once(&mut self) {
        match discover_clusters(
            self.registry.as_ref(),
            &self.config.elasticsearch_consul_tag,
        )
        .await
        {
            Ok(discovered) => self.reconcile_es(discovered).await,
            Err(e) => {
                error!(error = %e, "elasticsearch cluster discovery failed");
                self.metrics.inc_internal_errors();
            }
        }

        match discover_clusters(self.registry.as_ref(), &self.config.kibana_consul_tag).await {
            Ok(discovered) => self.reconcile_kibana(discovered).await,
            Err(e) => {
                error!(error = %e, "kibana cluster discovery failed");
                self.metrics.inc_internal_errors();
            }
        }
    }

    async fn reconcile_es(&mut self, discovered: HashMap<String, Cluster>) {
        let (to_add, to_remove) = diff_clusters(&discovered, &self.es_probes);

        for name in to_remove {
            flush_probe(&mut self.es_probes, &name).await;
        }

        for name in to_add {
            let cluster = discovered[&name].clone();
            match self.start_es_probe(&name, cluster).await {
                Ok(handle) => {
                    self.es_probes.insert(name, handle);
                }
                Err(e) => {
                    error!(cluster = %name, error = %e, "failed to start es probe");
                    self.metrics.inc_internal_errors();
                }
            }
        }
    }

    async fn reconcile_kibana(&mut self, discovered: HashMap<String, Cluster>) {
        let (to_add, to_remove) = diff_clusters(&discovered, &self.kibana_probes);

        for name in to_remove {
            flush_probe(&mut self.kibana_probes, &name).await;
        }

        for name in to_add {
            let cluster = discovered[&name].clone();
            match self.start_kibana_probe(&name, cluster).await {
                Ok(handle) => {
                    self.kibana_probes.insert(name, handle);
                }
                Err(e) => {
                    error!(cluster = %name, error = %e, "failed to start kibana probe");
                    self.metrics.inc_internal_errors();
                }
            }
        }
    }

    /// Initialize an Elasticsearch probe synchronously, then launch its
    /// run loop as an independent task. Registration happens only when
    /// endpoint resolution, bootstrap discovery and preparation all
    /// succeed.
    async fn start_es_probe(
        &self,
        name: &str,
        cluster: Cluster,
    ) -> Result<ProbeHandle, ProbeError> {
        info!(cluster = %name, "creating es probe");
        let endpoint = cluster_endpoint(
            self.registry.as_ref(),
            &cluster.service,
            &self.config.elasticsearch_endpoint_suffix,
            self.config.elasticsearch_endpoint_port,
        )
        .await?;

        let probe = EsProbe::new(
            name.to_string(),
            endpoint,
            cluster,
            self.config.clone(),
            self.registry.clone(),
            self.metrics.clone(),
        )
        .await?;
        probe.prepare().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(probe.run(shutdown_rx));
        Ok(ProbeHandle { shutdown, task })
    }

    async fn start_kibana_probe(
        &self,
        name: &str,
        cluster: Cluster,
    ) -> Result<ProbeHandle, ProbeError> {
        info!(cluster = %name, "creating kibana probe");
        let probe = KibanaProbe::new(
            name.to_string(),
            cluster,
            self.config.clone(),
            self.registry.clone(),
            self.metrics.clone(),
        )
        .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(probe.run(shutdown_rx));
        Ok(ProbeHandle { shutdown, task })
    }
}

/// Signal shutdown to a probe and wait for its drain to complete.
/// Sending on an already-finished probe is harmless; a join error means
/// the task is gone either way, so it is ignored.
async fn flush_probe(probes: &mut HashMap<String, ProbeHandle>, name: &str) {
    if let Some(handle) = probes.remove(name) {
        info!(cluster = %name, "removing probe for vanished cluster");
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prometheus::Registry;
    use sonde_discovery::{CatalogEntry, DiscoveryError, DiscoveryResult};

    struct MockRegistry {
        services: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl ServiceRegistry for MockRegistry {
        async fn resolve_service(&self, _name: &str) -> DiscoveryResult<Vec<CatalogEntry>> {
            Ok(Vec::new())
        }

        async fn list_services(&self) -> DiscoveryResult<HashMap<String, Vec<String>>> {
            Ok(self.services.clone())
        }

        async fn healthy_instance(&self, name: &str) -> DiscoveryResult<(u16, String)> {
            Err(DiscoveryError::NoHealthyInstance(name.to_string()))
        }
    }

    fn test_watcher(services: HashMap<String, Vec<String>>) -> Watcher {
        let metrics =
            Arc::new(SondeMetrics::register(&Registry::new()).expect("metrics registration"));
        Watcher::new(
            SondeConfig::default(),
            Arc::new(MockRegistry { services }),
            metrics,
        )
    }

    fn dummy_handle() -> (ProbeHandle, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        let mut task_rx = rx.clone();
        let task = tokio::spawn(async move {
            let _ = task_rx.changed().await;
        });
        (ProbeHandle { shutdown, task }, rx)
    }

    #[test]
    fn diff_computes_both_directions() {
        let discovered: HashMap<String, ()> =
            ["b", "c", "d"].iter().map(|s| (s.to_string(), ())).collect();
        let running: HashMap<String, ()> =
            ["a", "b", "c"].iter().map(|s| (s.to_string(), ())).collect();

        let (to_add, to_remove) = diff_clusters(&discovered, &running);
        assert_eq!(to_add, vec!["d"]);
        assert_eq!(to_remove, vec!["a"]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let discovered: HashMap<String, ()> = [("a".to_string(), ())].into_iter().collect();
        let running = discovered.clone();
        let (to_add, to_remove) = diff_clusters(&discovered, &running);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[tokio::test]
    async fn vanished_cluster_is_signalled_and_dropped() {
        let mut watcher = test_watcher(HashMap::new());
        let (handle, rx) = dummy_handle();
        watcher.es_probes.insert("old-cluster".to_string(), handle);

        watcher.reconcile_once().await;

        assert!(watcher.es_probes.is_empty());
        assert!(*rx.borrow(), "shutdown signal must have been sent");
    }

    #[tokio::test]
    async fn removal_waits_for_probe_drain() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut watcher = test_watcher(HashMap::new());
        let drained = Arc::new(AtomicBool::new(false));

        let (shutdown, mut rx) = watch::channel(false);
        let flag = drained.clone();
        let task = tokio::spawn(async move {
            let _ = rx.changed().await;
            flag.store(true, Ordering::SeqCst);
        });
        watcher.es_probes.insert("gone".to_string(), ProbeHandle { shutdown, task });

        watcher.reconcile_once().await;
        assert!(
            drained.load(Ordering::SeqCst),
            "reconciliation must not outrun the probe's drain"
        );
    }

    #[tokio::test]
    async fn failed_initialization_does_not_register_a_probe() {
        let mut services = HashMap::new();
        services.insert(
            "es-prod".to_string(),
            vec![
                "maintenance-elasticsearch".to_string(),
                "cluster_name-prod".to_string(),
                "version-7.10.0".to_string(),
            ],
        );
        // healthy_instance always fails, so endpoint resolution fails
        // and the probe must never be registered.
        let mut watcher = test_watcher(services);

        watcher.reconcile_once().await;
        assert!(watcher.es_probes.is_empty());
        assert!(watcher.kibana_probes.is_empty());
    }

    #[tokio::test]
    async fn surviving_cluster_keeps_its_probe() {
        let mut services = HashMap::new();
        services.insert(
            "es-live".to_string(),
            vec![
                "maintenance-elasticsearch".to_string(),
                "cluster_name-live".to_string(),
            ],
        );
        let mut watcher = test_watcher(services);
        let (handle, rx) = dummy_handle();
        watcher.es_probes.insert("live".to_string(), handle);

        watcher.reconcile_once().await;

        assert!(watcher.es_probes.contains_key("live"));
        assert!(!*rx.borrow(), "no shutdown for a still-discovered cluster");
    }
}
