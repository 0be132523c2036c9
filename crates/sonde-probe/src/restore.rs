//! Snapshot-restore verification.
//!
//! Locates the most recent successful snapshot produced by the configured
//! backup policy, restores the durability index under a renamed target
//! and counts the restored documents. Any step failing aborts only the
//! current attempt; the next scheduled tick retries from scratch.
//!
//! Two lookup variants exist: Elasticsearch exposes the SLM policy API
//! with a `last_success` field, while OpenSearch only offers the generic
//! snapshot listing, which needs client-side filtering by success state
//! and policy tag, then picking the maximum start time.

use tracing::info;

use sonde_metrics::SondeMetrics;

use crate::client::{EsClient, SnapshotInfo};
use crate::config::SondeConfig;
use crate::elasticsearch::RESTORE_MIN_MAJOR;
use crate::error::ProbeResult;

/// Whether the restore probe runs at all for a cluster.
pub(crate) fn restore_gate(enabled: bool, major_version: Option<u32>) -> bool {
    enabled && matches!(major_version, Some(m) if m >= RESTORE_MIN_MAJOR)
}

/// Pick the newest successful snapshot belonging to `policy`.
///
/// A snapshot belongs to the policy when its metadata names it or when
/// its name carries the policy prefix (OpenSearch snapshot management
/// names snapshots after the policy).
pub(crate) fn select_latest_snapshot<'a>(
    snapshots: &'a [SnapshotInfo],
    policy: &str,
) -> Option<&'a SnapshotInfo> {
    snapshots
        .iter()
        .filter(|s| s.state == "SUCCESS")
        .filter(|s| {
            s.metadata
                .as_ref()
                .and_then(|m| m.policy.as_deref())
                .map(|p| p == policy)
                .unwrap_or_else(|| s.snapshot.starts_with(policy))
        })
        .max_by_key(|s| s.start_time_in_millis)
}

async fn latest_snapshot(client: &EsClient, config: &SondeConfig) -> ProbeResult<Option<String>> {
    if config.opensearch {
        let snapshots = client
            .list_snapshots(&config.restore_snapshot_repository)
            .await?;
        Ok(select_latest_snapshot(&snapshots, &config.restore_snapshot_policy)
            .map(|s| s.snapshot.clone()))
    } else {
        client
            .slm_last_success(&config.restore_snapshot_policy)
            .await
    }
}

/// One restore verification cycle. Returns `Ok(false)` when no suitable
/// snapshot exists — a cluster without the snapshot feature configured
/// is a no-op, not an error.
pub(crate) async fn run_restore(
    client: &EsClient,
    config: &SondeConfig,
    metrics: &SondeMetrics,
    cluster_name: &str,
) -> ProbeResult<bool> {
    let Some(snapshot) = latest_snapshot(client, config).await? else {
        info!(
            cluster = %cluster_name,
            policy = %config.restore_snapshot_policy,
            "no successful snapshot found, skipping restore probe"
        );
        return Ok(false);
    };

    let restored = config.restored_index();

    // Drop the previous restore target before restoring into it again.
    client.delete_index(&restored).await?;
    client
        .restore_snapshot(
            &config.restore_snapshot_repository,
            &snapshot,
            &config.durability_index,
            &restored,
        )
        .await?;
    metrics.inc_restore_count(cluster_name);

    let count = client.count_documents(&restored).await?;
    metrics.set_restore_documents(cluster_name, count as f64);
    info!(cluster = %cluster_name, snapshot = %snapshot, documents = count, "restore verified");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SnapshotMetadata;

    #[test]
    fn gate_requires_flag_and_major_version() {
        assert!(!restore_gate(true, Some(6)), "6.8.3 must never restore");
        assert!(restore_gate(true, Some(7)), "7.10.0 restores when enabled");
        assert!(!restore_gate(false, Some(7)));
        assert!(!restore_gate(true, None));
        assert!(restore_gate(true, Some(8)));
    }

    fn snapshot(name: &str, state: &str, start: u64, policy: Option<&str>) -> SnapshotInfo {
        SnapshotInfo {
            snapshot: name.to_string(),
            state: state.to_string(),
            start_time_in_millis: start,
            metadata: policy.map(|p| SnapshotMetadata {
                policy: Some(p.to_string()),
            }),
        }
    }

    #[test]
    fn latest_successful_snapshot_wins() {
        let snapshots = vec![
            snapshot("sm-1", "SUCCESS", 100, Some("sm")),
            snapshot("sm-3", "IN_PROGRESS", 300, Some("sm")),
            snapshot("sm-2", "SUCCESS", 200, Some("sm")),
        ];
        let best = select_latest_snapshot(&snapshots, "sm").unwrap();
        assert_eq!(best.snapshot, "sm-2");
    }

    #[test]
    fn other_policies_are_filtered_out() {
        let snapshots = vec![
            snapshot("nightly-9", "SUCCESS", 900, Some("nightly")),
            snapshot("sm-1", "SUCCESS", 100, Some("sm")),
        ];
        let best = select_latest_snapshot(&snapshots, "sm").unwrap();
        assert_eq!(best.snapshot, "sm-1");
    }

    #[test]
    fn policy_prefix_matches_when_metadata_is_absent() {
        let snapshots = vec![
            snapshot("sm-2024", "SUCCESS", 500, None),
            snapshot("manual-backup", "SUCCESS", 600, None),
        ];
        let best = select_latest_snapshot(&snapshots, "sm").unwrap();
        assert_eq!(best.snapshot, "sm-2024");
    }

    #[test]
    fn no_candidates_yields_none() {
        assert!(select_latest_snapshot(&[], "sm").is_none());
        let failed = vec![snapshot("sm-1", "FAILED", 100, Some("sm"))];
        assert!(select_latest_snapshot(&failed, "sm").is_none());
    }
}
