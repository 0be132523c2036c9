//! Probe configuration, shared by every probe instance and the watcher.

use std::time::Duration;

/// Safety margin subtracted from the probe period to derive per-request
/// timeouts, so a hung call cannot starve the next tick.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SondeConfig {
    /// Consul tag marking Elasticsearch/OpenSearch services to monitor.
    pub elasticsearch_consul_tag: String,
    /// Consul tag marking Kibana services to monitor.
    pub kibana_consul_tag: String,
    /// Suffix appended to the service name to form the cluster endpoint;
    /// a `{dc}` placeholder is replaced by the instance's datacenter.
    pub elasticsearch_endpoint_suffix: String,
    /// Overrides the discovered port for cluster-level calls when non-zero.
    pub elasticsearch_endpoint_port: u16,
    pub elasticsearch_user: Option<String>,
    pub elasticsearch_password: Option<String>,

    /// Fixed-population index used to detect silent data loss.
    pub durability_index: String,
    /// Scratch index used to measure per-operation round-trip time.
    pub latency_index: String,
    /// Target document population for the durability index.
    pub durability_documents_target: u64,

    pub restore_enabled: bool,
    pub restore_snapshot_repository: String,
    pub restore_snapshot_policy: String,

    /// How many latency round-trips to run per minute.
    pub latency_probe_rate_per_min: u32,

    /// Discovery refresh period.
    pub consul_period: Duration,
    /// Node/durability probing period.
    pub probe_period: Duration,
    /// Restore verification period.
    pub restore_period: Duration,
    /// Metric pruning period.
    pub cleaning_period: Duration,

    /// Monitored clusters are OpenSearch: snapshots are located through
    /// the generic listing API instead of the SLM policy API.
    pub opensearch: bool,
}

impl SondeConfig {
    /// Timeout applied to every outbound probe request.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_period
            .saturating_sub(TIMEOUT_MARGIN)
            .max(Duration::from_secs(1))
    }

    /// Period between two latency round-trips.
    pub fn latency_probe_period(&self) -> Duration {
        let rate = self.latency_probe_rate_per_min.max(1) as u64;
        Duration::from_millis(60_000 / rate)
    }

    /// Name of the restore target index.
    pub fn restored_index(&self) -> String {
        format!("{}_restored", self.durability_index)
    }
}

impl Default for SondeConfig {
    fn default() -> Self {
        Self {
            elasticsearch_consul_tag: "maintenance-elasticsearch".to_string(),
            kibana_consul_tag: "maintenance-kibana".to_string(),
            elasticsearch_endpoint_suffix: ".service.{dc}.example.net".to_string(),
            elasticsearch_endpoint_port: 0,
            elasticsearch_user: None,
            elasticsearch_password: None,
            durability_index: ".sonde.durability".to_string(),
            latency_index: ".sonde.latency".to_string(),
            durability_documents_target: 100_000,
            restore_enabled: false,
            restore_snapshot_repository: "ceph_s3".to_string(),
            restore_snapshot_policy: "probe-snapshot-sm".to_string(),
            latency_probe_rate_per_min: 120,
            consul_period: Duration::from_secs(120),
            probe_period: Duration::from_secs(30),
            restore_period: Duration::from_secs(24 * 3600),
            cleaning_period: Duration::from_secs(600),
            opensearch: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_timeout_keeps_a_margin() {
        let config = SondeConfig {
            probe_period: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(config.probe_timeout(), Duration::from_secs(28));
    }

    #[test]
    fn probe_timeout_never_reaches_zero() {
        let config = SondeConfig {
            probe_period: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn latency_period_from_rate() {
        let config = SondeConfig {
            latency_probe_rate_per_min: 120,
            ..Default::default()
        };
        assert_eq!(config.latency_probe_period(), Duration::from_millis(500));

        let config = SondeConfig {
            latency_probe_rate_per_min: 0,
            ..Default::default()
        };
        // A zero rate is clamped instead of dividing by zero.
        assert_eq!(config.latency_probe_period(), Duration::from_secs(60));
    }
}
