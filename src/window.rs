//! Adaptive window walker.
//!
//! A window-based backfill walks backward through time one window per job.
//! Each window runs three sub-tasks as one fail-fast unit, persists a cursor
//! per page so a redelivery resumes near the failure point, and on completion
//! sizes and enqueues the next, strictly earlier window. The march stops once
//! the next window would lie entirely before the configured sync floor.
use crate::config::WindowSettings;
use crate::cursor::{CursorKey, CursorStore, CursorValue, SubTask, Walk};
use crate::db::{self, Pool};
use crate::error::SyncResult;
use crate::executor::join_all_or_fail;
use crate::indexing::{index_stored, IndexingTrigger};
use crate::model::{JobPayload, Provider, Record, ScheduledJob, TimeWindow, WindowJob};
use crate::progress::ProgressTracker;
use crate::provider::{
    with_page_size_fallback, ExportKind, ExportQuery, SearchQuery, WindowSource,
};
use crate::queue::JobQueue;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Pending,
    InProgress,
    Complete,
    SkippedBeforeFloor,
}

/// Records stored by each sub-task during one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Volumes {
    pub search: usize,
    pub primary: usize,
    pub secondary: usize,
}

impl Volumes {
    fn each(&self) -> [usize; 3] {
        [self.search, self.primary, self.secondary]
    }

    pub fn all_below(&self, mark: usize) -> bool {
        self.each().iter().all(|v| *v < mark)
    }

    pub fn any_above(&self, mark: usize) -> bool {
        self.each().iter().any(|v| *v > mark)
    }

    pub fn total(&self) -> usize {
        self.each().iter().sum()
    }
}

/// Size of the next window from the volumes observed in the current one:
/// shrink by the growth factor when any sub-task exceeded the high-water
/// mark, grow by it when all stayed below the low-water mark, else keep.
/// Always clamped to `[min_window, max_window]`.
pub fn next_window_size(current: Duration, volumes: &Volumes, settings: &WindowSettings) -> Duration {
    let current_ms = current.num_milliseconds() as f64;
    let scaled = if volumes.any_above(settings.high_water_mark) {
        current_ms / settings.growth_factor
    } else if volumes.all_below(settings.low_water_mark) {
        current_ms * settings.growth_factor
    } else {
        current_ms
    };
    Duration::milliseconds(scaled.round() as i64).clamp(settings.min_window(), settings.max_window())
}

/// The window preceding `current`: `(current.start - size, current.start - 1s)`
/// with the start clamped to `floor`. `None` when that window would end
/// before the floor.
pub fn next_window(current: &TimeWindow, size: Duration, floor: DateTime<Utc>) -> Option<TimeWindow> {
    let end = current.start - Duration::seconds(1);
    if end < floor {
        return None;
    }
    let start = (current.start - size).max(floor);
    Some(TimeWindow::new(start, Some(end)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    pub state: WindowState,
    pub volumes: Volumes,
    /// Window enqueued as the continuation, if any.
    pub next: Option<TimeWindow>,
}

#[derive(Clone)]
pub struct WindowWalker {
    pool: Pool,
    cursors: CursorStore,
    source: Arc<dyn WindowSource>,
    indexer: Arc<dyn IndexingTrigger>,
    tracker: ProgressTracker,
    queue: Arc<dyn JobQueue>,
    settings: WindowSettings,
    provider: Provider,
}

impl WindowWalker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool,
        source: Arc<dyn WindowSource>,
        indexer: Arc<dyn IndexingTrigger>,
        tracker: ProgressTracker,
        queue: Arc<dyn JobQueue>,
        settings: WindowSettings,
        provider: Provider,
    ) -> Self {
        Self {
            cursors: CursorStore::new(pool.clone()),
            pool,
            source,
            indexer,
            tracker,
            queue,
            settings,
            provider,
        }
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Trigger indexing for everything stored with a creation time in
    /// `[start, end]`, as read back from the store.
    pub async fn index_created(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        backfill_id: Option<uuid::Uuid>,
        suppress_notification: bool,
    ) -> SyncResult<usize> {
        let created = db::records_created_between(&self.pool, tenant_id, start, end).await?;
        index_stored(
            self.indexer.as_ref(),
            &self.tracker,
            tenant_id,
            backfill_id,
            suppress_notification,
            created,
        )
        .await
    }

    /// Trigger indexing for everything created or updated in `[start, end]`.
    /// Incremental passes use this so edits to older records reach the index.
    pub async fn index_changed(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        backfill_id: Option<uuid::Uuid>,
        suppress_notification: bool,
    ) -> SyncResult<usize> {
        let changed = db::records_changed_between(&self.pool, tenant_id, start, end).await?;
        index_stored(
            self.indexer.as_ref(),
            &self.tracker,
            tenant_id,
            backfill_id,
            suppress_notification,
            changed,
        )
        .await
    }

    /// Process one window of a backfill: fetch, index what was created in
    /// the window, then chain the next window.
    #[instrument(skip_all, fields(tenant_id = %job.tenant_id, provider = %self.provider, start = %window_job.window.start))]
    pub async fn walk(
        &self,
        job: &ScheduledJob,
        window_job: &WindowJob,
        now: DateTime<Utc>,
    ) -> SyncResult<WindowReport> {
        let tenant_id = job.tenant_id.as_str();
        let window = window_job.window;
        let floor = self.settings.sync_floor;
        let end = window.end_or(now);

        if end < floor {
            info!(%end, %floor, state = ?WindowState::SkippedBeforeFloor, "window predates sync floor");
            return Ok(WindowReport {
                state: WindowState::SkippedBeforeFloor,
                volumes: Volumes::default(),
                next: None,
            });
        }

        debug!(%end, state = ?WindowState::InProgress, "window started");
        let volumes = self
            .execute(tenant_id, &window, now, Walk::Backfill, window_job.force_refetch)
            .await?;

        self.index_created(
            tenant_id,
            window.start,
            end,
            job.backfill_id,
            job.suppress_notification,
        )
        .await?;
        self.cursors
            .clear_progress(tenant_id, self.provider, Walk::Backfill)
            .await?;

        let size = next_window_size(end - window.start, &volumes, &self.settings);
        let next = next_window(&window, size, floor);
        match next {
            Some(next) => {
                // Counted before it can possibly run, once per window start.
                let pending = match job.backfill_id {
                    Some(backfill_id) => {
                        db::claim_window_continuation(&self.pool, backfill_id, tenant_id, next.start)
                            .await?
                    }
                    None => true,
                };
                let next_job = ScheduledJob {
                    tenant_id: job.tenant_id.clone(),
                    backfill_id: job.backfill_id,
                    suppress_notification: job.suppress_notification,
                    start_timestamp: None,
                    payload: JobPayload::Window(WindowJob {
                        provider: self.provider,
                        window: next,
                        force_refetch: window_job.force_refetch,
                    }),
                };
                if pending {
                    self.queue.enqueue(&next_job, None).await?;
                    if let Some(backfill_id) = job.backfill_id {
                        db::mark_window_continuation_enqueued(&self.pool, backfill_id, tenant_id, next.start)
                            .await?;
                    }
                } else {
                    info!(next_start = %next.start, "continuation already queued");
                }
                info!(
                    search = volumes.search,
                    primary = volumes.primary,
                    secondary = volumes.secondary,
                    next_start = %next.start,
                    next_size_hours = size.num_hours(),
                    "window complete"
                );
            }
            None => {
                info!(total = volumes.total(), %floor, "window complete; reached sync floor");
            }
        }
        Ok(WindowReport {
            state: WindowState::Complete,
            volumes,
            next,
        })
    }

    /// Run the three sub-tasks for `window` as one unit. Resumes each from its
    /// mid-window cursor when that cursor lies inside the window.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %self.provider, walk = ?walk))]
    pub async fn execute(
        &self,
        tenant_id: &str,
        window: &TimeWindow,
        now: DateTime<Utc>,
        walk: Walk,
        force_refetch: bool,
    ) -> SyncResult<Volumes> {
        let start = window.start;
        let end = window.end_or(now);
        let bounded = TimeWindow::new(start, Some(end));
        let overlap = self.settings.resume_overlap();

        let search_upper = match self.resume_point(tenant_id, &bounded, walk, SubTask::Search).await? {
            Some(ts) => (ts + overlap).min(end),
            None => end,
        };
        let mut since = [start; 2];
        for (slot, kind) in [ExportKind::Primary, ExportKind::Secondary].into_iter().enumerate() {
            if let Some(ts) = self.resume_point(tenant_id, &bounded, walk, kind.subtask()).await? {
                since[slot] = (ts - overlap).max(start);
            }
        }

        let counts = join_all_or_fail(vec![
            self.search(tenant_id, start, search_upper, walk, force_refetch)
                .boxed(),
            self.export(tenant_id, ExportKind::Primary, since[0], end, walk, force_refetch)
                .boxed(),
            self.export(tenant_id, ExportKind::Secondary, since[1], end, walk, force_refetch)
                .boxed(),
        ])
        .await?;

        Ok(Volumes {
            search: counts[0],
            primary: counts[1],
            secondary: counts[2],
        })
    }

    /// Timestamp of a stored mid-window cursor, if it lies inside `window`.
    async fn resume_point(
        &self,
        tenant_id: &str,
        window: &TimeWindow,
        walk: Walk,
        subtask: SubTask,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        let key = CursorKey::progress(walk, self.provider, subtask);
        let Some(value) = self.cursors.get(tenant_id, &key).await? else {
            return Ok(None);
        };
        match value.as_timestamp() {
            Some(ts) if window.end.map_or(true, |end| ts <= end) && ts >= window.start => {
                info!(subtask = subtask.as_str(), %ts, "resuming from mid-window cursor");
                Ok(Some(ts))
            }
            _ => {
                warn!(subtask = subtask.as_str(), ?value, "ignoring stale mid-window cursor");
                Ok(None)
            }
        }
    }

    /// Reverse-chronological search over `[start, upper]`, newest first.
    async fn search(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        upper: DateTime<Utc>,
        walk: Walk,
        force_refetch: bool,
    ) -> SyncResult<usize> {
        let key = CursorKey::progress(walk, self.provider, SubTask::Search);
        let source = self.source.as_ref();
        let mut page_size = self.settings.page_size;
        let mut token: Option<String> = None;
        let mut stored = 0;

        loop {
            let base = SearchQuery {
                created_after: start,
                created_before: upper,
                page_token: token.take(),
                page_size,
            };
            let (page, used) =
                with_page_size_fallback(page_size, self.settings.min_page_size, |size| {
                    let query = SearchQuery {
                        page_size: size,
                        ..base.clone()
                    };
                    async move { source.search_page(tenant_id, &query).await }
                })
                .await?;
            page_size = used;

            let reached_start = page.items.iter().any(|r| r.created_at < start);
            let records: Vec<Record> = page
                .items
                .into_iter()
                .filter(|r| r.created_at >= start && r.created_at <= upper)
                .collect();
            if let Some(earliest) = records.iter().map(|r| r.created_at).min() {
                self.store(tenant_id, &records, force_refetch).await?;
                self.cursors
                    .set(tenant_id, &key, &CursorValue::Timestamp(earliest))
                    .await?;
                stored += records.len();
            }
            debug!(stored, %upper, "search page done");

            if reached_start || page.next.is_none() {
                return Ok(stored);
            }
            token = page.next;
        }
    }

    /// Forward export of one record kind from `since`, stopping at the end of
    /// the stream or the first record updated after `end`.
    async fn export(
        &self,
        tenant_id: &str,
        kind: ExportKind,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        walk: Walk,
        force_refetch: bool,
    ) -> SyncResult<usize> {
        let key = CursorKey::progress(walk, self.provider, kind.subtask());
        let source = self.source.as_ref();
        let mut page_size = self.settings.page_size;
        let mut token: Option<String> = None;
        let mut stored = 0;

        loop {
            let base = ExportQuery {
                since,
                page_token: token.take(),
                page_size,
            };
            let (page, used) =
                with_page_size_fallback(page_size, self.settings.min_page_size, |size| {
                    let query = ExportQuery {
                        page_size: size,
                        ..base.clone()
                    };
                    async move { source.export_page(tenant_id, kind, &query).await }
                })
                .await?;
            page_size = used;

            let crossed_end = page.items.iter().any(|r| r.updated_at > end);
            let records: Vec<Record> = page
                .items
                .into_iter()
                .filter(|r| r.updated_at >= since && r.updated_at <= end)
                .collect();
            if let Some(furthest) = records.iter().map(|r| r.updated_at).max() {
                self.store(tenant_id, &records, force_refetch).await?;
                self.cursors
                    .set(tenant_id, &key, &CursorValue::Timestamp(furthest))
                    .await?;
                stored += records.len();
            }
            debug!(kind = ?kind, stored, "export page done");

            if crossed_end || page.next.is_none() {
                return Ok(stored);
            }
            token = page.next;
        }
    }

    async fn store(&self, tenant_id: &str, records: &[Record], force_refetch: bool) -> SyncResult<()> {
        db::upsert_records(&self.pool, tenant_id, records).await?;
        self.resolve_identities(tenant_id, records, force_refetch)
            .await
    }

    /// Fetch identities referenced by `records`: only unknown ones, or all of
    /// them with `force_refetch`. Ids the provider no longer returns are
    /// marked deleted.
    async fn resolve_identities(
        &self,
        tenant_id: &str,
        records: &[Record],
        force_refetch: bool,
    ) -> SyncResult<()> {
        let referenced: BTreeSet<&String> =
            records.iter().flat_map(|r| r.identity_refs.iter()).collect();
        let mut wanted: Vec<String> = referenced.into_iter().cloned().collect();
        if !force_refetch && !wanted.is_empty() {
            let known = db::known_identity_ids(&self.pool, tenant_id, self.provider, &wanted).await?;
            wanted.retain(|id| !known.contains(id));
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let found = self.source.fetch_identities(tenant_id, &wanted).await?;
        let found_ids: HashSet<&str> = found.iter().map(|i| i.id.as_str()).collect();
        let missing: Vec<String> = wanted
            .iter()
            .filter(|id| !found_ids.contains(id.as_str()))
            .cloned()
            .collect();
        db::upsert_identities(&self.pool, tenant_id, self.provider, &found).await?;
        db::mark_identities_deleted(&self.pool, tenant_id, self.provider, &missing).await?;
        debug!(fetched = found.len(), deleted = missing.len(), "identities resolved");
        Ok(())
    }
}
