//! sonded — whitebox probing daemon for search clusters.
//!
//! Single binary that assembles the subsystems:
//! - Consul-backed discovery
//! - Prometheus metrics sink + `/metrics` exposition
//! - Cluster watcher spawning one probe task per discovered cluster
//!
//! # Usage
//!
//! ```text
//! sonded serve --consul-api 127.0.0.1:8500 --metrics-port 2112
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::{ArgAction, Parser, Subcommand};
use prometheus::Registry;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sonde_discovery::ConsulRegistry;
use sonde_metrics::SondeMetrics;
use sonde_probe::SondeConfig;
use sonde_watcher::Watcher;

#[derive(Parser)]
#[command(name = "sonded", about = "Whitebox probing for Elasticsearch/OpenSearch clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover every tagged cluster in Consul and probe it forever.
    Serve {
        /// Consul agent api, host:port.
        #[arg(long, short = 'a', default_value = "127.0.0.1:8500")]
        consul_api: String,

        /// Node discovery update interval in seconds.
        #[arg(long, default_value = "120")]
        consul_period: u64,

        /// Node and durability probing interval in seconds.
        #[arg(long, default_value = "30")]
        probe_period: u64,

        /// Restore probing interval in seconds.
        #[arg(long, default_value = "86400")]
        restore_period: u64,

        /// Metric pruning interval for vanished nodes, in seconds.
        #[arg(long, default_value = "600")]
        cleaning_period: u64,

        /// Consul tag marking Elasticsearch services to monitor.
        #[arg(long, default_value = "maintenance-elasticsearch")]
        elasticsearch_consul_tag: String,

        /// Suffix appended to the service name to build the cluster
        /// endpoint; `{dc}` is replaced by the datacenter.
        #[arg(long, default_value = ".service.{dc}.example.net")]
        elasticsearch_endpoint_suffix: String,

        /// Port override for cluster-level calls (0 = use the
        /// discovered port).
        #[arg(long, default_value = "0")]
        elasticsearch_endpoint_port: u16,

        /// Elasticsearch username.
        #[arg(long)]
        elasticsearch_user: Option<String>,

        /// Elasticsearch password.
        #[arg(long)]
        elasticsearch_password: Option<String>,

        /// Durability index name.
        #[arg(long, default_value = ".sonde.durability")]
        elasticsearch_durability_index: String,

        /// Latency index name.
        #[arg(long, default_value = ".sonde.latency")]
        elasticsearch_latency_index: String,

        /// Target number of documents in the durability index.
        #[arg(long, default_value = "100000")]
        elasticsearch_durability_documents: u64,

        /// Perform the snapshot-restore verification.
        #[arg(long, default_value = "false")]
        elasticsearch_restore: bool,

        /// Snapshot repository used by the restore probe.
        #[arg(long, default_value = "ceph_s3")]
        elasticsearch_restore_snapshot_repository: String,

        /// Snapshot policy used by the restore probe.
        #[arg(long, default_value = "probe-snapshot-sm")]
        elasticsearch_restore_snapshot_policy: String,

        /// How many latency round-trips to run per minute.
        #[arg(long, default_value = "120")]
        latency_probe_rate_per_min: u32,

        /// Consul tag marking Kibana services to monitor.
        #[arg(long, default_value = "maintenance-kibana")]
        kibana_consul_tag: String,

        /// Port where Prometheus metrics are exposed.
        #[arg(long, short = 'p', default_value = "2112")]
        metrics_port: u16,

        /// Log level (trace, debug, info, warn, error).
        #[arg(long, short = 'l', default_value = "info")]
        log_level: String,

        /// Monitored clusters are OpenSearch.
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        opensearch: bool,
    },
}

/// Clamp a period to its floor; refreshing faster than the floor is
/// silently corrected, not rejected.
fn clamp_period(name: &str, value: Duration, floor: Duration) -> Duration {
    if value < floor {
        warn!(
            period = name,
            requested = value.as_secs(),
            floor = floor.as_secs(),
            "period below the allowed floor, clamping up"
        );
        floor
    } else {
        value
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            consul_api,
            consul_period,
            probe_period,
            restore_period,
            cleaning_period,
            elasticsearch_consul_tag,
            elasticsearch_endpoint_suffix,
            elasticsearch_endpoint_port,
            elasticsearch_user,
            elasticsearch_password,
            elasticsearch_durability_index,
            elasticsearch_latency_index,
            elasticsearch_durability_documents,
            elasticsearch_restore,
            elasticsearch_restore_snapshot_repository,
            elasticsearch_restore_snapshot_policy,
            latency_probe_rate_per_min,
            kibana_consul_tag,
            metrics_port,
            log_level,
            opensearch,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .or_else(|_| EnvFilter::try_new(&log_level))
                        .unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            info!("logger initialized");

            let consul_period = clamp_period(
                "discovery",
                Duration::from_secs(consul_period),
                Duration::from_secs(60),
            );
            let probe_period = clamp_period(
                "probing",
                Duration::from_secs(probe_period),
                Duration::from_secs(20),
            );
            let cleaning_period = clamp_period(
                "pruning",
                Duration::from_secs(cleaning_period),
                Duration::from_secs(240),
            );
            info!(
                discovery = consul_period.as_secs(),
                probing = probe_period.as_secs(),
                pruning = cleaning_period.as_secs(),
                "intervals initialized"
            );
            if elasticsearch_restore {
                info!(restore = restore_period, "restore probing enabled");
            }
            if opensearch {
                info!("monitoring opensearch clusters");
            }

            let config = SondeConfig {
                elasticsearch_consul_tag,
                kibana_consul_tag,
                elasticsearch_endpoint_suffix,
                elasticsearch_endpoint_port,
                elasticsearch_user,
                elasticsearch_password,
                durability_index: elasticsearch_durability_index,
                latency_index: elasticsearch_latency_index,
                durability_documents_target: elasticsearch_durability_documents,
                restore_enabled: elasticsearch_restore,
                restore_snapshot_repository: elasticsearch_restore_snapshot_repository,
                restore_snapshot_policy: elasticsearch_restore_snapshot_policy,
                latency_probe_rate_per_min,
                consul_period,
                probe_period,
                restore_period: Duration::from_secs(restore_period),
                cleaning_period,
                opensearch,
            };

            serve(consul_api, metrics_port, config).await
        }
    }
}

async fn serve(consul_api: String, metrics_port: u16, config: SondeConfig) -> anyhow::Result<()> {
    let registry = Registry::new();
    let metrics =
        Arc::new(SondeMetrics::register(&registry).context("failed to register metric families")?);

    // A metrics endpoint that cannot bind makes the whole process
    // useless; fail hard before any probing starts.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics_port))
        .await
        .with_context(|| format!("failed to bind metrics endpoint on port {metrics_port}"))?;
    info!(port = metrics_port, "metrics endpoint listening");

    let render_metrics = {
        let metrics = metrics.clone();
        move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }
    };
    let app = Router::new().route("/metrics", get(render_metrics));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "metrics endpoint failed");
            std::process::exit(1);
        }
    });

    let consul =
        Arc::new(ConsulRegistry::new(&consul_api).context("failed to create consul client")?);

    info!("entering serve main loop");
    Watcher::new(config, consul, metrics).watch_forever().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_below_floor_are_clamped_up() {
        assert_eq!(
            clamp_period("discovery", Duration::from_secs(5), Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn periods_at_or_above_floor_pass_through() {
        assert_eq!(
            clamp_period("probing", Duration::from_secs(20), Duration::from_secs(20)),
            Duration::from_secs(20)
        );
        assert_eq!(
            clamp_period("probing", Duration::from_secs(45), Duration::from_secs(20)),
            Duration::from_secs(45)
        );
    }
}
