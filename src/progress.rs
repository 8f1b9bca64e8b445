//! Backfill progress counters and completion detection.
//!
//! Every counter change is a single atomic SQL add, so any number of
//! uncoordinated workers may report progress for the same run. The caller
//! whose increment makes the run complete claims the completion row and fires
//! the notification; later callers see the row already claimed.
use crate::db::{self, Counter, Pool};
use crate::model::{BackfillRun, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn backfill_completed(&self, run: &BackfillRun) -> Result<()>;
}

/// Writes completion as a structured log line.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn backfill_completed(&self, run: &BackfillRun) -> Result<()> {
        info!(
            backfill_id = %run.backfill_id,
            tenant_id = %run.tenant_id,
            provider = %run.provider,
            ingest_jobs = run.total_ingest_jobs,
            failed_ingest_jobs = run.attempted_ingest_jobs - run.done_ingest_jobs,
            index_jobs = run.total_index_jobs,
            "backfill completed"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    pool: Pool,
    notifier: Arc<dyn CompletionNotifier>,
}

impl ProgressTracker {
    pub fn new(pool: Pool, notifier: Arc<dyn CompletionNotifier>) -> Self {
        Self { pool, notifier }
    }

    /// Create the counters row of a new backfill and return its id.
    #[instrument(skip(self))]
    pub async fn start_run(
        &self,
        tenant_id: &str,
        provider: Provider,
        suppress_notification: bool,
    ) -> Result<Uuid> {
        let backfill_id = Uuid::new_v4();
        db::create_backfill_run(
            &self.pool,
            backfill_id,
            tenant_id,
            provider,
            suppress_notification,
        )
        .await?;
        info!(%backfill_id, "backfill run created");
        Ok(backfill_id)
    }

    pub async fn get(&self, backfill_id: Uuid, tenant_id: &str) -> Result<Option<BackfillRun>> {
        db::get_backfill_run(&self.pool, backfill_id, tenant_id).await
    }

    pub async fn increment_total_ingest_jobs(
        &self,
        backfill_id: Uuid,
        tenant_id: &str,
        n: i64,
    ) -> Result<BackfillRun> {
        db::increment_counter(&self.pool, backfill_id, tenant_id, Counter::TotalIngestJobs, n).await
    }

    pub async fn increment_attempted_ingest_jobs(
        &self,
        backfill_id: Uuid,
        tenant_id: &str,
        n: i64,
    ) -> Result<BackfillRun> {
        let run = db::increment_counter(
            &self.pool,
            backfill_id,
            tenant_id,
            Counter::AttemptedIngestJobs,
            n,
        )
        .await?;
        self.check_completion(&run).await?;
        Ok(run)
    }

    pub async fn increment_done_ingest_jobs(
        &self,
        backfill_id: Uuid,
        tenant_id: &str,
        n: i64,
    ) -> Result<BackfillRun> {
        db::increment_counter(&self.pool, backfill_id, tenant_id, Counter::DoneIngestJobs, n).await
    }

    pub async fn increment_total_index_jobs(
        &self,
        backfill_id: Uuid,
        tenant_id: &str,
        n: i64,
    ) -> Result<BackfillRun> {
        db::increment_counter(&self.pool, backfill_id, tenant_id, Counter::TotalIndexJobs, n).await
    }

    /// Called by the indexing side when an index job of this run finishes.
    pub async fn increment_done_index_jobs(
        &self,
        backfill_id: Uuid,
        tenant_id: &str,
        n: i64,
    ) -> Result<BackfillRun> {
        let run =
            db::increment_counter(&self.pool, backfill_id, tenant_id, Counter::DoneIndexJobs, n)
                .await?;
        self.check_completion(&run).await?;
        Ok(run)
    }

    /// Claim the completion transition if `run` observed it. Returns true for
    /// the single caller that fired (or would have fired) the notification.
    async fn check_completion(&self, run: &BackfillRun) -> Result<bool> {
        if !run.is_complete() {
            return Ok(false);
        }
        let claimed =
            db::claim_completion(&self.pool, run.backfill_id, &run.tenant_id, Utc::now()).await?;
        if !claimed {
            return Ok(false);
        }
        if run.suppress_notification {
            info!(backfill_id = %run.backfill_id, "backfill completed; notification suppressed");
            return Ok(true);
        }
        // Completion is already recorded; notification errors are only logged.
        if let Err(err) = self.notifier.backfill_completed(run).await {
            warn!(?err, backfill_id = %run.backfill_id, "completion notification failed");
        }
        Ok(true)
    }
}
