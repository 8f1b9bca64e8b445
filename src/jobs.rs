//! Job handlers.
//!
//! [`JobRunner`] is built once at startup from stateless services and the
//! shared pool, then handles every delivery: deferred dispatch first, then
//! the job's work, then progress bookkeeping.
use crate::config::Config;
use crate::cursor::{CursorKey, CursorStore, CursorValue};
use crate::db::{self, Pool, StoredRecordRef};
use crate::dispatch::{DeferPolicy, JobOutcome};
use crate::error::{SyncError, SyncResult};
use crate::executor::run_isolated;
use crate::incremental::run_incremental;
use crate::indexing::{index_stored, IndexingTrigger};
use crate::model::{BatchJob, IndexDoneJob, JobPayload, Provider, ScheduledJob, WindowJob, WorkUnit};
use crate::progress::ProgressTracker;
use crate::provider::ProviderRegistry;
use crate::queue::{JobHandler, JobQueue};
use crate::window::WindowWalker;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

const DEFAULT_UNIT_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct JobRunner {
    pool: Pool,
    config: Arc<Config>,
    cursors: CursorStore,
    tracker: ProgressTracker,
    queue: Arc<dyn JobQueue>,
    indexer: Arc<dyn IndexingTrigger>,
    providers: ProviderRegistry,
    defer: DeferPolicy,
}

impl JobRunner {
    pub fn new(
        pool: Pool,
        config: Arc<Config>,
        tracker: ProgressTracker,
        queue: Arc<dyn JobQueue>,
        indexer: Arc<dyn IndexingTrigger>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            cursors: CursorStore::new(pool.clone()),
            defer: DeferPolicy::from_config(&config.queue),
            pool,
            config,
            tracker,
            queue,
            indexer,
            providers,
        }
    }

    /// Handle one delivery at `now`. Rate limits and early deliveries come
    /// back as [`JobOutcome::Retry`]; only real failures are errors.
    #[instrument(skip_all, fields(tenant_id = %job.tenant_id, kind = job.payload.kind(), provider = %job.payload.provider()))]
    pub async fn run(&self, job: &ScheduledJob, now: DateTime<Utc>) -> anyhow::Result<JobOutcome> {
        if let Some(after) = self.defer.defer_for(job.start_timestamp, now) {
            info!(?after, start = ?job.start_timestamp, "not due yet");
            return Ok(JobOutcome::Retry(after));
        }

        let res = match &job.payload {
            JobPayload::Batch(batch) => self.run_batch(job, batch).await,
            JobPayload::Window(window) => self.run_window(job, window, now).await,
            JobPayload::Incremental(_) => self.run_incremental(job, now).await,
            JobPayload::IndexDone(done) => self.run_index_done(job, done).await,
        };
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(SyncError::RateLimited(after)) => {
                let outcome = self.defer.rate_limited(after);
                warn!(?after, ?outcome, "rate limited; redelivering");
                return Ok(outcome);
            }
            Err(SyncError::Other(err)) => return Err(err),
            Err(err) => return Err(err.into()),
        };

        if outcome == JobOutcome::Done {
            self.finish_ingest_job(job).await?;
        }
        Ok(outcome)
    }

    /// Terminal success of an ingest job: done and attempted, in that order,
    /// so the completion check sees both.
    async fn finish_ingest_job(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        let Some(backfill_id) = job.backfill_id else {
            return Ok(());
        };
        if !job.payload.is_ingest() {
            return Ok(());
        }
        self.tracker
            .increment_done_ingest_jobs(backfill_id, &job.tenant_id, 1)
            .await?;
        self.tracker
            .increment_attempted_ingest_jobs(backfill_id, &job.tenant_id, 1)
            .await?;
        Ok(())
    }

    fn unit_concurrency(&self, provider: Provider) -> usize {
        self.config
            .provider(provider)
            .map(|c| c.unit_concurrency)
            .unwrap_or(DEFAULT_UNIT_CONCURRENCY)
    }

    fn walker(&self, provider: Provider) -> SyncResult<WindowWalker> {
        let settings = self
            .config
            .provider(provider)
            .and_then(|c| c.window.clone())
            .ok_or_else(|| anyhow!("provider {provider} has no window settings"))?;
        let source = self
            .providers
            .window_source(provider)
            .ok_or_else(|| anyhow!("no window source registered for {provider}"))?;
        Ok(WindowWalker::new(
            self.pool.clone(),
            source,
            self.indexer.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            settings,
            provider,
        ))
    }

    /// Fetch every unit of a batch with bounded concurrency. A failing unit is
    /// logged and skipped; a rate limit stores the finished units in the
    /// batch's progress cursor and asks for redelivery.
    #[instrument(skip_all, fields(batch_index = batch_job.batch.batch_index, units = batch_job.batch.units.len()))]
    async fn run_batch(&self, job: &ScheduledJob, batch_job: &BatchJob) -> SyncResult<JobOutcome> {
        let provider = batch_job.provider;
        let tenant_id = job.tenant_id.as_str();
        let source = self
            .providers
            .unit_source(provider)
            .ok_or_else(|| anyhow!("no unit source registered for {provider}"))?;

        let progress_key = job.backfill_id.map(|backfill_id| CursorKey::BatchProgress {
            backfill_id,
            batch_index: batch_job.batch.batch_index,
        });
        let mut completed: BTreeSet<String> = match &progress_key {
            Some(key) => match self.cursors.get(tenant_id, key).await? {
                Some(CursorValue::Completed(ids)) => ids.into_iter().collect(),
                _ => BTreeSet::new(),
            },
            None => BTreeSet::new(),
        };
        let unindexed_key = job.backfill_id.map(|backfill_id| CursorKey::BatchUnindexed {
            backfill_id,
            batch_index: batch_job.batch.batch_index,
        });
        let mut stored: Vec<StoredRecordRef> = match &unindexed_key {
            Some(key) => match self.cursors.get(tenant_id, key).await? {
                Some(CursorValue::Unindexed(refs)) => refs,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        let carried_over = !stored.is_empty();
        let pending: Vec<WorkUnit> = batch_job
            .batch
            .units
            .iter()
            .filter(|u| !completed.contains(&u.id))
            .cloned()
            .collect();
        if pending.len() < batch_job.batch.units.len() {
            info!(skipped = batch_job.batch.units.len() - pending.len(), "resuming batch");
        }

        let source = source.as_ref();
        let pool = &self.pool;
        let report = run_isolated(pending, self.unit_concurrency(provider), |unit: WorkUnit| async move {
            let records = source.fetch_unit(tenant_id, &unit).await?;
            db::upsert_records(pool, tenant_id, &records).await?;
            Ok::<_, SyncError>(
                records
                    .into_iter()
                    .map(|r| StoredRecordRef {
                        source_type: r.source_type,
                        external_id: r.external_id,
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await;

        for (unit, err) in &report.failed {
            warn!(unit = %unit.id, group = ?unit.group, ?err, "unit failed; skipping");
        }

        for (unit, refs) in report.succeeded.iter() {
            completed.insert(unit.id.clone());
            stored.extend(refs.iter().cloned());
        }
        // Progress and unindexed refs must outlive a failed indexing trigger.
        if let (Some(progress), Some(unindexed)) = (&progress_key, &unindexed_key) {
            if !report.succeeded.is_empty() {
                let value = CursorValue::Completed(completed.iter().cloned().collect());
                self.cursors.set(tenant_id, progress, &value).await?;
                self.cursors
                    .set(tenant_id, unindexed, &CursorValue::Unindexed(stored.clone()))
                    .await?;
            }
        }
        if carried_over {
            info!(records = stored.len(), "retrying indexing of stored records");
        }
        let triggered = !stored.is_empty();
        index_stored(
            self.indexer.as_ref(),
            &self.tracker,
            tenant_id,
            job.backfill_id,
            job.suppress_notification,
            stored,
        )
        .await?;
        if triggered {
            if let Some(key) = &unindexed_key {
                self.cursors.clear(tenant_id, key).await?;
            }
        }

        if let Some(after) = report.retry_after {
            if let Some(key) = &progress_key {
                let value = CursorValue::Completed(completed.into_iter().collect());
                self.cursors.set(tenant_id, key, &value).await?;
            }
            info!(
                succeeded = report.succeeded.len(),
                deferred = report.deferred.len(),
                "batch rate limited"
            );
            return Ok(self.defer.rate_limited(after));
        }

        if let Some(key) = &progress_key {
            self.cursors.clear(tenant_id, key).await?;
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch done"
        );
        Ok(JobOutcome::Done)
    }

    async fn run_window(
        &self,
        job: &ScheduledJob,
        window_job: &WindowJob,
        now: DateTime<Utc>,
    ) -> SyncResult<JobOutcome> {
        self.walker(window_job.provider)?
            .walk(job, window_job, now)
            .await?;
        Ok(JobOutcome::Done)
    }

    async fn run_index_done(&self, job: &ScheduledJob, done: &IndexDoneJob) -> SyncResult<JobOutcome> {
        let backfill_id = job
            .backfill_id
            .ok_or_else(|| anyhow!("index-done job without a backfill id"))?;
        let run = self
            .tracker
            .increment_done_index_jobs(backfill_id, &job.tenant_id, i64::from(done.count))
            .await?;
        info!(
            %backfill_id,
            done = run.done_index_jobs,
            total = run.total_index_jobs,
            "index jobs acknowledged"
        );
        Ok(JobOutcome::Done)
    }

    async fn run_incremental(&self, job: &ScheduledJob, now: DateTime<Utc>) -> SyncResult<JobOutcome> {
        let walker = self.walker(job.payload.provider())?;
        run_incremental(&walker, &job.tenant_id, job.suppress_notification, now).await?;
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: &ScheduledJob) -> anyhow::Result<JobOutcome> {
        self.run(job, Utc::now()).await
    }

    /// Final failure still counts as an attempt so the run can complete.
    async fn on_dead_letter(&self, job: &ScheduledJob, err: &anyhow::Error) -> anyhow::Result<()> {
        let Some(backfill_id) = job.backfill_id else {
            return Ok(());
        };
        if !job.payload.is_ingest() {
            return Ok(());
        }
        warn!(%backfill_id, tenant_id = %job.tenant_id, err = %err, "ingest job gave up");
        self.tracker
            .increment_attempted_ingest_jobs(backfill_id, &job.tenant_id, 1)
            .await?;
        Ok(())
    }
}
