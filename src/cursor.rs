//! Per-tenant cursor store.
//!
//! Cursor keys are a closed enum rendered to prefixed strings, so two purposes
//! can never share a key. Each key has exactly one active writer at a time by
//! scheduling construction, hence no locking here.
use crate::db::{self, Pool, StoredRecordRef};
use crate::model::Provider;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Concurrent sub-task of a window job. Each owns one progress cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTask {
    /// Reverse-chronological search over creation time.
    Search,
    /// Forward incremental export of the primary record kind.
    Primary,
    /// Forward incremental export of a second, independent record kind.
    Secondary,
}

impl SubTask {
    pub const ALL: [SubTask; 3] = [SubTask::Search, SubTask::Primary, SubTask::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubTask::Search => "search",
            SubTask::Primary => "primary",
            SubTask::Secondary => "secondary",
        }
    }
}

/// Which kind of walk owns a set of mid-window cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Walk {
    Backfill,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorKey {
    /// Incremental "synced until" marker of a provider.
    SyncedUntil(Provider),
    /// Mid-window progress of one sub-task; cleared when the window completes.
    WindowProgress(Provider, SubTask),
    /// Progress of one sub-task of an in-flight incremental run.
    IncrementalProgress(Provider, SubTask),
    /// Units of a batch job already stored, for redeliveries.
    BatchProgress { backfill_id: Uuid, batch_index: u32 },
    /// Records a batch stored whose indexing has not been triggered yet.
    BatchUnindexed { backfill_id: Uuid, batch_index: u32 },
}

impl CursorKey {
    pub fn progress(walk: Walk, provider: Provider, subtask: SubTask) -> Self {
        match walk {
            Walk::Backfill => CursorKey::WindowProgress(provider, subtask),
            Walk::Incremental => CursorKey::IncrementalProgress(provider, subtask),
        }
    }

    pub fn render(&self) -> String {
        match self {
            CursorKey::SyncedUntil(p) => format!("synced_until/{p}"),
            CursorKey::WindowProgress(p, t) => format!("window/{p}/{}", t.as_str()),
            CursorKey::IncrementalProgress(p, t) => format!("incremental/{p}/{}", t.as_str()),
            CursorKey::BatchProgress {
                backfill_id,
                batch_index,
            } => format!("batch/{backfill_id}/{batch_index}"),
            CursorKey::BatchUnindexed {
                backfill_id,
                batch_index,
            } => format!("batch_unindexed/{backfill_id}/{batch_index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CursorValue {
    Timestamp(DateTime<Utc>),
    Token(String),
    Completed(Vec<String>),
    Unindexed(Vec<StoredRecordRef>),
}

impl CursorValue {
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CursorValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CursorStore {
    pool: Pool,
}

impl CursorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Read a cursor. An unreadable stored value is logged and treated as absent.
    pub async fn get(&self, tenant_id: &str, key: &CursorKey) -> Result<Option<CursorValue>> {
        let rendered = key.render();
        let Some(raw) = db::get_cursor(&self.pool, tenant_id, &rendered).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(tenant_id, key = %rendered, ?err, "ignoring unreadable cursor value");
                Ok(None)
            }
        }
    }

    pub async fn set(&self, tenant_id: &str, key: &CursorKey, value: &CursorValue) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        db::set_cursor(&self.pool, tenant_id, &key.render(), &raw).await
    }

    /// Idempotent.
    pub async fn clear(&self, tenant_id: &str, key: &CursorKey) -> Result<()> {
        db::clear_cursor(&self.pool, tenant_id, &key.render()).await
    }

    pub async fn synced_until(
        &self,
        tenant_id: &str,
        provider: Provider,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get(tenant_id, &CursorKey::SyncedUntil(provider))
            .await?
            .and_then(|v| v.as_timestamp()))
    }

    /// Move the synced-until marker forward. Returns false (and writes
    /// nothing) when `ts` is not later than the stored value.
    pub async fn advance_synced_until(
        &self,
        tenant_id: &str,
        provider: Provider,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(current) = self.synced_until(tenant_id, provider).await? {
            if ts <= current {
                debug!(tenant_id, %provider, %current, attempted = %ts, "synced-until not advanced");
                return Ok(false);
            }
        }
        self.set(
            tenant_id,
            &CursorKey::SyncedUntil(provider),
            &CursorValue::Timestamp(ts),
        )
        .await?;
        Ok(true)
    }

    /// Explicit operator reset: set the marker to `to`, or remove it.
    pub async fn reset_synced_until(
        &self,
        tenant_id: &str,
        provider: Provider,
        to: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let key = CursorKey::SyncedUntil(provider);
        warn!(tenant_id, %provider, to = ?to, "resetting synced-until cursor");
        match to {
            Some(ts) => self.set(tenant_id, &key, &CursorValue::Timestamp(ts)).await,
            None => self.clear(tenant_id, &key).await,
        }
    }

    /// Clear the mid-window cursors of every sub-task of a walk.
    pub async fn clear_progress(&self, tenant_id: &str, provider: Provider, walk: Walk) -> Result<()> {
        for subtask in SubTask::ALL {
            self.clear(tenant_id, &CursorKey::progress(walk, provider, subtask))
                .await?;
        }
        Ok(())
    }

    pub async fn keys_with_prefix(&self, tenant_id: &str, prefix: &str) -> Result<Vec<String>> {
        db::list_cursor_keys(&self.pool, tenant_id, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_do_not_collide() {
        let id = Uuid::nil();
        let keys = [
            CursorKey::SyncedUntil(Provider::Zendesk).render(),
            CursorKey::WindowProgress(Provider::Zendesk, SubTask::Search).render(),
            CursorKey::WindowProgress(Provider::Zendesk, SubTask::Primary).render(),
            CursorKey::WindowProgress(Provider::Hubspot, SubTask::Search).render(),
            CursorKey::IncrementalProgress(Provider::Zendesk, SubTask::Search).render(),
            CursorKey::BatchProgress {
                backfill_id: id,
                batch_index: 0,
            }
            .render(),
            CursorKey::BatchUnindexed {
                backfill_id: id,
                batch_index: 0,
            }
            .render(),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys[0], "synced_until/zendesk");
        assert_eq!(keys[1], "window/zendesk/search");
    }

    #[test]
    fn value_encoding_is_tagged() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        let raw = serde_json::to_string(&CursorValue::Timestamp(ts)).unwrap();
        assert!(raw.contains("\"type\":\"timestamp\""));
        let back: CursorValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.as_timestamp(), Some(ts));
        assert_eq!(CursorValue::Token("abc".into()).as_timestamp(), None);
    }

    #[tokio::test]
    async fn unreadable_value_reads_as_absent() {
        let pool = db::memory_pool().await.unwrap();
        let key = CursorKey::SyncedUntil(Provider::Jira);
        db::set_cursor(&pool, "t1", &key.render(), "not json")
            .await
            .unwrap();
        let store = CursorStore::new(pool);
        assert!(store.get("t1", &key).await.unwrap().is_none());
    }
}
