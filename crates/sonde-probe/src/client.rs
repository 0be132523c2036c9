//! Cluster-level HTTP client for Elasticsearch/OpenSearch.
//!
//! A thin reqwest wrapper: basic credentials are attached per request
//! when configured, and TLS verification is relaxed for internal-network
//! targets. Only the response fields the probes read are modelled.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ProbeError, ProbeResult};

/// Filler payload carried by every probe document.
const DOCUMENT_DATA: &str = "While the exact amount of text data in a kilobyte (KB) or megabyte \
     (MB) can vary depending on the nature of a document, a kilobyte can hold about half of a \
     page of text, while a megabyte holds about 500 pages of text.";

/// A document written to the durability or latency index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsDocument {
    pub name: String,
    pub event_type: String,
    pub team: String,
    pub counter: u64,
    pub data: String,
}

impl EsDocument {
    /// Durability document `i`; keyed by its stable integer suffix so
    /// replenishment fills gaps instead of creating duplicates.
    pub fn durability(i: u64) -> Self {
        Self {
            name: format!("document-{i}"),
            event_type: "durability".to_string(),
            team: "nosql".to_string(),
            counter: i,
            data: DOCUMENT_DATA.to_string(),
        }
    }

    /// Throwaway latency document with a caller-supplied unique id.
    pub fn latency(document_id: &str) -> Self {
        Self {
            name: document_id.to_string(),
            event_type: "search".to_string(),
            team: "nosql".to_string(),
            counter: 1,
            data: DOCUMENT_DATA.to_string(),
        }
    }
}

/// Which search response schema the cluster speaks.
///
/// Selected from the parsed major version, never from a string prefix:
/// `hits.total` is a bare number up to 6.x and an object from 7.0 on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchApiFlavor {
    Legacy,
    Modern,
}

impl SearchApiFlavor {
    pub fn from_major(major: Option<u32>) -> Self {
        match major {
            Some(m) if m < 7 => SearchApiFlavor::Legacy,
            _ => SearchApiFlavor::Modern,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterHealthResponse {
    #[serde(default)]
    indices: HashMap<String, IndexHealth>,
}

#[derive(Debug, Deserialize)]
struct IndexHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
struct SlmPolicy {
    #[serde(default)]
    last_success: Option<SlmInvocation>,
}

#[derive(Debug, Deserialize)]
struct SlmInvocation {
    snapshot_name: String,
}

/// One entry from the generic snapshot listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub start_time_in_millis: u64,
    #[serde(default)]
    pub metadata: Option<SnapshotMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotListResponse {
    #[serde(default)]
    snapshots: Vec<SnapshotInfo>,
}

/// HTTP client bound to one cluster endpoint.
pub struct EsClient {
    http: reqwest::Client,
    base: String,
    target: String,
    username: Option<String>,
    password: Option<String>,
}

impl EsClient {
    pub fn new(
        scheme: &str,
        endpoint: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> ProbeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            base: format!("{scheme}://{endpoint}"),
            target: endpoint.to_string(),
            username,
            password,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base));
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        req
    }

    fn check(&self, operation: &'static str, resp: Response) -> ProbeResult<Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(ProbeError::Status {
                operation,
                target: self.target.clone(),
                status: resp.status().as_u16(),
            })
        }
    }

    fn shape_error(&self, operation: &'static str, message: impl Into<String>) -> ProbeError {
        ProbeError::Shape {
            operation,
            target: self.target.clone(),
            message: message.into(),
        }
    }

    // ── Index lifecycle ────────────────────────────────────────

    /// Create `index` unless it already exists.
    pub async fn ensure_index(&self, index: &str) -> ProbeResult<()> {
        let resp = self.request(Method::HEAD, &format!("/{index}")).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                let resp = self.request(Method::PUT, &format!("/{index}")).send().await?;
                self.check("index create", resp)?;
                Ok(())
            }
            s if s.is_success() => Ok(()),
            s => Err(ProbeError::Status {
                operation: "index exists",
                target: self.target.clone(),
                status: s.as_u16(),
            }),
        }
    }

    /// Delete `index`; a missing index is not an error.
    pub async fn delete_index(&self, index: &str) -> ProbeResult<()> {
        let resp = self
            .request(Method::DELETE, &format!("/{index}"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.check("index delete", resp)?;
        Ok(())
    }

    // ── Documents ──────────────────────────────────────────────

    pub async fn index_document(
        &self,
        index: &str,
        document_id: &str,
        document: &EsDocument,
    ) -> ProbeResult<()> {
        let resp = self
            .request(Method::PUT, &format!("/{index}/_doc/{document_id}"))
            .json(document)
            .send()
            .await?;
        self.check("document index", resp)?;
        Ok(())
    }

    pub async fn get_document(&self, index: &str, document_id: &str) -> ProbeResult<()> {
        let resp = self
            .request(Method::GET, &format!("/{index}/_doc/{document_id}"))
            .send()
            .await?;
        self.check("document get", resp)?;
        Ok(())
    }

    pub async fn delete_document(&self, index: &str, document_id: &str) -> ProbeResult<()> {
        let resp = self
            .request(Method::DELETE, &format!("/{index}/_doc/{document_id}"))
            .send()
            .await?;
        self.check("document delete", resp)?;
        Ok(())
    }

    pub async fn count_documents(&self, index: &str) -> ProbeResult<u64> {
        let resp = self
            .request(Method::GET, &format!("/{index}/_count"))
            .send()
            .await?;
        let resp = self.check("document count", resp)?;
        let body: CountResponse = resp
            .json()
            .await
            .map_err(|e| self.shape_error("document count", e.to_string()))?;
        Ok(body.count)
    }

    // ── Search & health ────────────────────────────────────────

    /// Range search over the durability population; returns total hits.
    pub async fn search_range(&self, index: &str, flavor: SearchApiFlavor) -> ProbeResult<u64> {
        let mut body = json!({
            "query": { "range": { "counter": { "gte": 10, "lte": 80 } } },
        });
        if flavor == SearchApiFlavor::Modern {
            body["track_total_hits"] = json!(true);
        }

        let resp = self
            .request(Method::POST, &format!("/{index}/_search"))
            .json(&body)
            .send()
            .await?;
        let resp = self.check("search", resp)?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| self.shape_error("search", e.to_string()))?;

        parse_search_hits(&value, flavor)
            .ok_or_else(|| self.shape_error("search", "missing hits.total"))
    }

    /// Index health status string (`green`/`yellow`/`red`).
    pub async fn index_health(&self, index: &str) -> ProbeResult<String> {
        let resp = self
            .request(Method::GET, &format!("/_cluster/health/{index}?level=indices"))
            .send()
            .await?;
        let resp = self.check("cluster health", resp)?;
        let body: ClusterHealthResponse = resp
            .json()
            .await
            .map_err(|e| self.shape_error("cluster health", e.to_string()))?;
        body.indices
            .get(index)
            .map(|h| h.status.clone())
            .ok_or_else(|| {
                self.shape_error("cluster health", format!("missing indices.{index}.status"))
            })
    }

    // ── Snapshots ──────────────────────────────────────────────

    /// Name of the last successful snapshot produced by an SLM policy,
    /// or `None` when the policy does not exist or has never succeeded.
    pub async fn slm_last_success(&self, policy: &str) -> ProbeResult<Option<String>> {
        let resp = self
            .request(Method::GET, &format!("/_slm/policy/{policy}"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check("slm policy", resp)?;
        let body: HashMap<String, SlmPolicy> = resp
            .json()
            .await
            .map_err(|e| self.shape_error("slm policy", e.to_string()))?;
        Ok(body
            .get(policy)
            .and_then(|p| p.last_success.as_ref())
            .map(|s| s.snapshot_name.clone()))
    }

    /// All snapshots in `repository`; an unknown repository yields an
    /// empty list rather than an error.
    pub async fn list_snapshots(&self, repository: &str) -> ProbeResult<Vec<SnapshotInfo>> {
        let resp = self
            .request(Method::GET, &format!("/_snapshot/{repository}/_all"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = self.check("snapshot list", resp)?;
        let body: SnapshotListResponse = resp
            .json()
            .await
            .map_err(|e| self.shape_error("snapshot list", e.to_string()))?;
        Ok(body.snapshots)
    }

    /// Restore `index` out of `snapshot` under the name `renamed`,
    /// waiting for completion.
    pub async fn restore_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        index: &str,
        renamed: &str,
    ) -> ProbeResult<()> {
        let body = json!({
            "indices": index,
            "rename_pattern": index,
            "rename_replacement": renamed,
            "include_global_state": false,
        });
        let resp = self
            .request(
                Method::POST,
                &format!("/_snapshot/{repository}/{snapshot}/_restore?wait_for_completion=true"),
            )
            .json(&body)
            .send()
            .await?;
        self.check("snapshot restore", resp)?;
        Ok(())
    }
}

/// Extract `hits.total` according to the response schema flavor.
pub(crate) fn parse_search_hits(value: &Value, flavor: SearchApiFlavor) -> Option<u64> {
    let total = value.get("hits")?.get("total")?;
    match flavor {
        SearchApiFlavor::Legacy => total.as_u64(),
        SearchApiFlavor::Modern => total.get("value")?.as_u64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavor_from_major_version() {
        assert_eq!(SearchApiFlavor::from_major(Some(6)), SearchApiFlavor::Legacy);
        assert_eq!(SearchApiFlavor::from_major(Some(5)), SearchApiFlavor::Legacy);
        assert_eq!(SearchApiFlavor::from_major(Some(7)), SearchApiFlavor::Modern);
        // "60.0" parses to major 60 and must not be treated as 6.x.
        assert_eq!(SearchApiFlavor::from_major(Some(60)), SearchApiFlavor::Modern);
        assert_eq!(SearchApiFlavor::from_major(None), SearchApiFlavor::Modern);
    }

    #[test]
    fn parse_hits_modern_shape() {
        let value = json!({"hits": {"total": {"value": 71, "relation": "eq"}}});
        assert_eq!(parse_search_hits(&value, SearchApiFlavor::Modern), Some(71));
        assert_eq!(parse_search_hits(&value, SearchApiFlavor::Legacy), None);
    }

    #[test]
    fn parse_hits_legacy_shape() {
        let value = json!({"hits": {"total": 71}});
        assert_eq!(parse_search_hits(&value, SearchApiFlavor::Legacy), Some(71));
        assert_eq!(parse_search_hits(&value, SearchApiFlavor::Modern), None);
    }

    #[test]
    fn parse_hits_missing_field() {
        let value = json!({"took": 3});
        assert_eq!(parse_search_hits(&value, SearchApiFlavor::Modern), None);
    }

    #[test]
    fn durability_document_is_keyed_by_suffix() {
        let doc = EsDocument::durability(42);
        assert_eq!(doc.name, "document-42");
        assert_eq!(doc.counter, 42);
        assert_eq!(doc.event_type, "durability");
    }
}
