#![allow(dead_code)]

use async_trait::async_trait;
use backfill_engine::config::{self, Config};
use backfill_engine::db::{self, Pool};
use backfill_engine::error::{SyncError, SyncResult};
use backfill_engine::indexing::{IndexRequest, IndexingTrigger};
use backfill_engine::jobs::JobRunner;
use backfill_engine::model::{BackfillRun, Identity, Record, ScheduledJob, WorkUnit};
use backfill_engine::planner::Planner;
use backfill_engine::progress::{CompletionNotifier, ProgressTracker};
use backfill_engine::provider::{
    ExportKind, ExportQuery, Page, ProviderRegistry, SearchQuery, UnitSource, WindowSource,
};
use backfill_engine::queue::SqliteQueue;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn record(source_type: &str, id: &str, created: DateTime<Utc>, updated: DateTime<Utc>) -> Record {
    Record {
        source_type: source_type.to_string(),
        external_id: id.to_string(),
        created_at: created,
        updated_at: updated,
        identity_refs: Vec::new(),
        payload: json!({ "id": id }),
    }
}

pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.app.max_attempts = 3;
    cfg.queue.safety_buffer_seconds = 3;
    cfg.queue.max_redelivery_delay_seconds = 900;
    config::validate(&cfg).unwrap();
    cfg
}

// ---------------------------------------------------------------------------
// Recording fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub completed: Mutex<Vec<BackfillRun>>,
    pub fail: bool,
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn backfill_completed(&self, run: &BackfillRun) -> anyhow::Result<()> {
        self.completed.lock().await.push(run.clone());
        if self.fail {
            anyhow::bail!("notification endpoint down");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingIndexer {
    pub requests: Mutex<Vec<IndexRequest>>,
    responses: Mutex<VecDeque<SyncResult<()>>>,
    /// Acknowledge every accepted request as a finished index job.
    ack: Option<ProgressTracker>,
}

impl RecordingIndexer {
    pub fn acking(tracker: ProgressTracker) -> Self {
        Self {
            ack: Some(tracker),
            ..Default::default()
        }
    }

    pub async fn push_response(&self, res: SyncResult<()>) {
        self.responses.lock().await.push_back(res);
    }

    pub async fn indexed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .requests
            .lock()
            .await
            .iter()
            .flat_map(|r| r.ids.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl IndexingTrigger for RecordingIndexer {
    async fn trigger_indexing(&self, request: &IndexRequest) -> SyncResult<()> {
        let res = self.responses.lock().await.pop_front().unwrap_or(Ok(()));
        res?;
        self.requests.lock().await.push(request.clone());
        if let (Some(tracker), Some(id)) = (&self.ack, request.backfill_id) {
            tracker
                .increment_done_index_jobs(id, &request.tenant_id, 1)
                .await?;
        }
        Ok(())
    }
}

/// Unit source answering from a script per unit id; unscripted units return
/// one record named after the unit.
#[derive(Default)]
pub struct ScriptedUnitSource {
    scripted: Mutex<HashMap<String, VecDeque<SyncResult<Vec<Record>>>>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedUnitSource {
    pub async fn script(&self, unit_id: &str, res: SyncResult<Vec<Record>>) {
        self.scripted
            .lock()
            .await
            .entry(unit_id.to_string())
            .or_default()
            .push_back(res);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl UnitSource for ScriptedUnitSource {
    async fn fetch_unit(&self, _tenant_id: &str, unit: &WorkUnit) -> SyncResult<Vec<Record>> {
        self.calls.lock().await.push(unit.id.clone());
        let scripted = self
            .scripted
            .lock()
            .await
            .get_mut(&unit.id)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(res) => res,
            None => {
                let at = ts(2024, 2, 1, 0);
                Ok(vec![record("file", &unit.id, at, at)])
            }
        }
    }
}

/// In-memory provider with a search index and two export streams.
/// Search ignores its lower bound so the walker has to stop on its own.
#[derive(Default)]
pub struct FakeWindowSource {
    pub search: Vec<Record>,
    pub primary: Vec<Record>,
    pub secondary: Vec<Record>,
    pub upstream_identities: HashSet<String>,
    pub search_failures: Mutex<VecDeque<Option<SyncError>>>,
    pub search_calls: Mutex<Vec<SearchQuery>>,
    pub export_calls: Mutex<Vec<(ExportKind, ExportQuery)>>,
    pub identity_calls: Mutex<Vec<Vec<String>>>,
}

impl FakeWindowSource {
    pub async fn fail_search(&self, failures: Vec<Option<SyncError>>) {
        self.search_failures.lock().await.extend(failures);
    }
}

fn paginate(mut items: Vec<Record>, token: Option<&str>, size: u32) -> Page<Record> {
    let offset: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
    let size = size as usize;
    let end = (offset + size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    let page: Vec<Record> = if offset < items.len() {
        items.drain(offset..end).collect()
    } else {
        Vec::new()
    };
    Page { items: page, next }
}

#[async_trait]
impl WindowSource for FakeWindowSource {
    async fn search_page(&self, _tenant_id: &str, query: &SearchQuery) -> SyncResult<Page<Record>> {
        self.search_calls.lock().await.push(query.clone());
        if let Some(Some(err)) = self.search_failures.lock().await.pop_front() {
            return Err(err);
        }
        let mut items: Vec<Record> = self
            .search
            .iter()
            .filter(|r| r.created_at <= query.created_before)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(items, query.page_token.as_deref(), query.page_size))
    }

    async fn export_page(
        &self,
        _tenant_id: &str,
        kind: ExportKind,
        query: &ExportQuery,
    ) -> SyncResult<Page<Record>> {
        self.export_calls.lock().await.push((kind, query.clone()));
        let stream = match kind {
            ExportKind::Primary => &self.primary,
            ExportKind::Secondary => &self.secondary,
        };
        let mut items: Vec<Record> = stream
            .iter()
            .filter(|r| r.updated_at >= query.since)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(paginate(items, query.page_token.as_deref(), query.page_size))
    }

    async fn fetch_identities(&self, _tenant_id: &str, ids: &[String]) -> SyncResult<Vec<Identity>> {
        self.identity_calls.lock().await.push(ids.to_vec());
        Ok(ids
            .iter()
            .filter(|id| self.upstream_identities.contains(*id))
            .map(|id| Identity {
                id: id.clone(),
                payload: json!({ "name": id }),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub tracker: ProgressTracker,
    pub notifier: Arc<RecordingNotifier>,
    pub indexer: Arc<RecordingIndexer>,
    pub queue: Arc<SqliteQueue>,
}

impl Harness {
    pub async fn new(config: Config) -> Self {
        Self::build(config, false).await
    }

    /// Harness whose indexer acknowledges index jobs right away.
    pub async fn acking(config: Config) -> Self {
        Self::build(config, true).await
    }

    async fn build(config: Config, ack: bool) -> Self {
        let pool = db::memory_pool().await.unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = ProgressTracker::new(pool.clone(), notifier.clone());
        let indexer = if ack {
            RecordingIndexer::acking(tracker.clone())
        } else {
            RecordingIndexer::default()
        };
        Self {
            queue: Arc::new(SqliteQueue::new(pool.clone())),
            pool,
            config: Arc::new(config),
            tracker,
            notifier,
            indexer: Arc::new(indexer),
        }
    }

    pub fn runner(&self, providers: ProviderRegistry) -> JobRunner {
        JobRunner::new(
            self.pool.clone(),
            self.config.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            self.indexer.clone(),
            providers,
        )
    }

    pub fn planner(&self) -> Planner {
        Planner::new(self.config.clone(), self.tracker.clone(), self.queue.clone())
    }

    /// Queued jobs in emission order.
    pub async fn queued(&self) -> Vec<ScheduledJob> {
        db::list_jobs(&self.pool)
            .await
            .unwrap()
            .iter()
            .map(|row| serde_json::from_str(&row.payload).unwrap())
            .collect()
    }

    pub async fn run(&self, id: uuid::Uuid, tenant_id: &str) -> BackfillRun {
        self.tracker.get(id, tenant_id).await.unwrap().unwrap()
    }
}
