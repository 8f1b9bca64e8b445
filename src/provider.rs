//! Provider API seams.
//!
//! Concrete API clients live outside this crate; they implement
//! [`UnitSource`] (providers backfilled from an enumerated id list) and/or
//! [`WindowSource`] (providers walked through time windows). Any call may
//! return [`SyncError::RateLimited`].
use crate::cursor::SubTask;
use crate::error::{SyncError, SyncResult};
use crate::model::{Identity, Provider, Record, WorkUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// One page of provider results. `next = None` means the stream is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Reverse-chronological search over creation time, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub created_after: DateTime<Utc>,
    pub created_before: DateTime<Utc>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

/// Forward incremental export, ordered by update time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportQuery {
    pub since: DateTime<Utc>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

/// Independent record kinds fetched with forward exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportKind {
    Primary,
    Secondary,
}

impl ExportKind {
    pub fn subtask(self) -> SubTask {
        match self {
            ExportKind::Primary => SubTask::Primary,
            ExportKind::Secondary => SubTask::Secondary,
        }
    }
}

#[async_trait]
pub trait UnitSource: Send + Sync {
    /// Fetch one work unit and whatever records hang off it.
    async fn fetch_unit(&self, tenant_id: &str, unit: &WorkUnit) -> SyncResult<Vec<Record>>;
}

#[async_trait]
pub trait WindowSource: Send + Sync {
    async fn search_page(&self, tenant_id: &str, query: &SearchQuery) -> SyncResult<Page<Record>>;

    async fn export_page(
        &self,
        tenant_id: &str,
        kind: ExportKind,
        query: &ExportQuery,
    ) -> SyncResult<Page<Record>>;

    /// Returns the subset of `ids` that still exists upstream.
    async fn fetch_identities(&self, tenant_id: &str, ids: &[String]) -> SyncResult<Vec<Identity>>;
}

/// Provider clients by provider, built once at startup and shared.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    units: HashMap<Provider, Arc<dyn UnitSource>>,
    windows: HashMap<Provider, Arc<dyn WindowSource>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit_source(mut self, provider: Provider, source: Arc<dyn UnitSource>) -> Self {
        self.units.insert(provider, source);
        self
    }

    pub fn with_window_source(mut self, provider: Provider, source: Arc<dyn WindowSource>) -> Self {
        self.windows.insert(provider, source);
        self
    }

    pub fn unit_source(&self, provider: Provider) -> Option<Arc<dyn UnitSource>> {
        self.units.get(&provider).cloned()
    }

    pub fn window_source(&self, provider: Provider) -> Option<Arc<dyn WindowSource>> {
        self.windows.get(&provider).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.windows.is_empty()
    }
}

/// Call `f` with `page_size`; on a timeout retry once with half the size.
/// Fails with the timeout when the halved size would drop below `min_page_size`.
/// Returns the result together with the page size that produced it.
pub async fn with_page_size_fallback<T, F, Fut>(
    page_size: u32,
    min_page_size: u32,
    f: F,
) -> SyncResult<(T, u32)>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    match f(page_size).await {
        Err(SyncError::Timeout) => {
            let halved = page_size / 2;
            if halved < min_page_size.max(1) {
                return Err(SyncError::Timeout);
            }
            warn!(page_size, halved, "provider timed out; retrying with smaller pages");
            f(halved).await.map(|v| (v, halved))
        }
        other => other.map(|v| (v, page_size)),
    }
}
