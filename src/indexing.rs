use crate::config;
use crate::db::StoredRecordRef;
use crate::error::{SyncError, SyncResult};
use crate::progress::ProgressTracker;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ids per indexing request.
pub const MAX_IDS_PER_REQUEST: usize = 500;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// One indexing job as handed to the indexing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub tenant_id: String,
    pub source_type: String,
    pub ids: Vec<String>,
    #[serde(default)]
    pub backfill_id: Option<Uuid>,
    #[serde(default)]
    pub suppress_notification: bool,
}

#[async_trait]
pub trait IndexingTrigger: Send + Sync {
    async fn trigger_indexing(&self, request: &IndexRequest) -> SyncResult<()>;
}

/// Posts index requests as JSON to the indexing service.
#[derive(Clone)]
pub struct HttpIndexer {
    http: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for HttpIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIndexer")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpIndexer {
    pub fn new(endpoint: &str, token: String) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid indexer endpoint")?;
        let http = Client::builder()
            .user_agent(concat!("backfill-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    pub fn from_config(cfg: &config::Indexer) -> anyhow::Result<Self> {
        Self::new(&cfg.endpoint, cfg.token.clone())
    }

    pub fn build_request(&self, request: &IndexRequest) -> anyhow::Result<reqwest::Request> {
        let url = self
            .endpoint
            .join("v1/index")
            .context("invalid indexer endpoint")?;
        let mut builder = self.http.post(url).json(request);
        if !self.token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.token));
        }
        builder.build().context("failed to build index request")
    }
}

#[async_trait]
impl IndexingTrigger for HttpIndexer {
    async fn trigger_indexing(&self, request: &IndexRequest) -> SyncResult<()> {
        let http_request = self.build_request(request)?;
        debug!(url = %http_request.url(), ids = request.ids.len(), "posting index request");
        let res = self.http.execute(http_request).await.map_err(|err| {
            if err.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Other(anyhow::Error::new(err).context("failed to reach indexer"))
            }
        })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(?after, "rate limited by indexer");
            return Err(SyncError::RateLimited(after));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::Other(anyhow!("indexer error {status}: {body}")));
        }
        Ok(())
    }
}

/// `Retry-After` in delta-seconds form.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Trigger indexing for stored records, one request per source type and
/// chunk of ids. A run's total index jobs is bumped after each accepted
/// request so failed triggers are never counted. Returns the number of
/// requests sent.
pub async fn index_stored(
    indexer: &dyn IndexingTrigger,
    tracker: &ProgressTracker,
    tenant_id: &str,
    backfill_id: Option<Uuid>,
    suppress_notification: bool,
    refs: Vec<StoredRecordRef>,
) -> SyncResult<usize> {
    let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for r in refs {
        by_type.entry(r.source_type).or_default().push(r.external_id);
    }

    let mut sent = 0;
    for (source_type, ids) in by_type {
        for chunk in ids.chunks(MAX_IDS_PER_REQUEST) {
            let request = IndexRequest {
                tenant_id: tenant_id.to_string(),
                source_type: source_type.clone(),
                ids: chunk.to_vec(),
                backfill_id,
                suppress_notification,
            };
            indexer.trigger_indexing(&request).await?;
            if let Some(id) = backfill_id {
                tracker.increment_total_index_jobs(id, tenant_id, 1).await?;
            }
            sent += 1;
        }
    }
    if sent > 0 {
        info!(tenant_id, requests = sent, "indexing triggered");
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IndexRequest {
        IndexRequest {
            tenant_id: "acme".into(),
            source_type: "ticket".into(),
            ids: vec!["1".into(), "2".into()],
            backfill_id: None,
            suppress_notification: true,
        }
    }

    #[test]
    fn build_request_posts_json_with_bearer() {
        let indexer = HttpIndexer::new("http://indexer.local/", "s3cret".into()).unwrap();
        let req = indexer.build_request(&request()).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "http://indexer.local/v1/index");
        assert_eq!(
            req.headers().get("authorization").unwrap(),
            "Bearer s3cret"
        );
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["source_type"], "ticket");
        assert_eq!(json["ids"], serde_json::json!(["1", "2"]));
        assert_eq!(json["suppress_notification"], true);
    }

    #[test]
    fn empty_token_sends_no_auth_header() {
        let indexer = HttpIndexer::new("http://indexer.local/", String::new()).unwrap();
        let req = indexer.build_request(&request()).unwrap();
        assert!(req.headers().get("authorization").is_none());
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
