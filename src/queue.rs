//! At-least-once job transport and the worker step that drives it.
//!
//! The queue is the scheduler: a worker claims one due job under a lease,
//! runs the handler within the lease, and branches explicitly on the outcome.
use crate::config::Config;
use crate::db::{self, Pool, QueuedJobRow};
use crate::dispatch::JobOutcome;
use crate::error::SyncError;
use crate::model::ScheduledJob;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job`, visible after `delay` (immediately when `None`).
    /// Jobs enqueued with equal visibility are delivered in enqueue order.
    async fn enqueue(&self, job: &ScheduledJob, delay: Option<Duration>) -> Result<()>;
}

/// Consumer side of the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ScheduledJob) -> Result<JobOutcome>;

    /// Cleanup after the final failed delivery, before the job is dead-lettered.
    async fn on_dead_letter(&self, job: &ScheduledJob, err: &anyhow::Error) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: Pool,
}

impl SqliteQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: &ScheduledJob, delay: Option<Duration>) -> Result<()> {
        let payload = serde_json::to_string(job).context("failed to encode job")?;
        let delay_ms = delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        let due_at_ms = Utc::now().timestamp_millis() + delay_ms;
        db::enqueue_job(&self.pool, &job.tenant_id, &payload, due_at_ms).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Lease on a claimed job, and the handler's time budget.
    pub visibility_timeout: Duration,
    pub max_backoff_secs: i64,
    pub max_attempts: i32,
    pub max_redelivery_delay: Duration,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            visibility_timeout: cfg.queue.visibility_timeout(),
            max_backoff_secs: cfg.app.max_backoff_seconds as i64,
            max_attempts: cfg.app.max_attempts,
            max_redelivery_delay: cfg.queue.max_redelivery_delay(),
            poll_interval: Duration::from_millis(cfg.app.poll_interval_ms),
        }
    }
}

/// Claim and process one due job. Returns false when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    handler: &dyn JobHandler,
    settings: &WorkerSettings,
) -> Result<bool> {
    let now_ms = Utc::now().timestamp_millis();
    let lease_until = now_ms + settings.visibility_timeout.as_millis() as i64;
    let Some(row) = db::claim_next_job(pool, now_ms, lease_until).await? else {
        return Ok(false);
    };

    let job: ScheduledJob = match serde_json::from_str(&row.payload) {
        Ok(job) => job,
        Err(err) => {
            error!(id = row.id, ?err, "undecodable job payload; dead-lettering");
            db::dead_letter_job(pool, row.id, &format!("undecodable payload: {err}")).await?;
            return Ok(true);
        }
    };

    let res = match tokio::time::timeout(settings.visibility_timeout, handler.handle(&job)).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!(
            "job exceeded its {:?} time budget",
            settings.visibility_timeout
        )),
    };

    match res {
        Ok(JobOutcome::Done) => {
            db::delete_job(pool, row.id).await?;
            info!(id = row.id, kind = job.payload.kind(), tenant_id = %job.tenant_id, "job done");
        }
        Ok(JobOutcome::Retry(after)) => {
            redeliver(pool, &row, after.min(settings.max_redelivery_delay)).await?;
        }
        Err(err) => {
            if let Some(after) = SyncError::rate_limit_in(&err) {
                warn!(id = row.id, ?after, "rate limit escaped handler; redelivering");
                redeliver(pool, &row, after.min(settings.max_redelivery_delay)).await?;
            } else {
                fail(pool, handler, settings, &row, &job, err).await?;
            }
        }
    }
    Ok(true)
}

async fn redeliver(pool: &Pool, row: &QueuedJobRow, after: Duration) -> Result<()> {
    let due_at_ms = Utc::now().timestamp_millis() + after.as_millis() as i64;
    db::redeliver_job_at(pool, row.id, due_at_ms).await?;
    info!(id = row.id, ?after, "job deferred");
    Ok(())
}

async fn fail(
    pool: &Pool,
    handler: &dyn JobHandler,
    settings: &WorkerSettings,
    row: &QueuedJobRow,
    job: &ScheduledJob,
    err: anyhow::Error,
) -> Result<()> {
    if row.attempt + 1 >= settings.max_attempts {
        error!(id = row.id, attempt = row.attempt, ?err, "job failed permanently; dead-lettering");
        if let Err(cleanup) = handler.on_dead_letter(job, &err).await {
            // Leave the job leased; it is redelivered after the lease and the
            // cleanup runs again.
            error!(id = row.id, ?cleanup, "dead-letter cleanup failed");
            return Ok(());
        }
        db::dead_letter_job(pool, row.id, &format!("{err:#}")).await?;
    } else {
        let secs = db::backoff_job_with_cap(
            pool,
            row.id,
            row.attempt,
            settings.max_backoff_secs,
            Utc::now().timestamp_millis(),
        )
        .await?;
        warn!(id = row.id, attempt = row.attempt, ?err, backoff_secs = secs, "job failed; backoff");
    }
    Ok(())
}

/// Drain the queue forever, sleeping `poll_interval` when nothing is due.
pub async fn run_worker(pool: Pool, handler: &dyn JobHandler, settings: WorkerSettings) {
    loop {
        match process_next_job(&pool, handler, &settings).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(settings.poll_interval).await,
            Err(err) => {
                error!(?err, "queue worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IncrementalJob, JobPayload, Provider};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedHandler {
        outcomes: Mutex<VecDeque<Result<JobOutcome>>>,
        dead: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(outcomes: Vec<Result<JobOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                dead: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &ScheduledJob) -> Result<JobOutcome> {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(JobOutcome::Done))
        }

        async fn on_dead_letter(&self, job: &ScheduledJob, _err: &anyhow::Error) -> Result<()> {
            self.dead.lock().unwrap().push(job.tenant_id.clone());
            Ok(())
        }
    }

    fn settings(max_attempts: i32) -> WorkerSettings {
        WorkerSettings {
            visibility_timeout: Duration::from_secs(30),
            max_backoff_secs: 60,
            max_attempts,
            max_redelivery_delay: Duration::from_secs(900),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn job() -> ScheduledJob {
        ScheduledJob {
            tenant_id: "acme".into(),
            backfill_id: None,
            suppress_notification: false,
            start_timestamp: None,
            payload: JobPayload::Incremental(IncrementalJob {
                provider: Provider::Zendesk,
            }),
        }
    }

    #[tokio::test]
    async fn done_deletes_and_empty_queue_reports_idle() {
        let pool = db::memory_pool().await.unwrap();
        SqliteQueue::new(pool.clone()).enqueue(&job(), None).await.unwrap();
        let handler = ScriptedHandler::new(vec![Ok(JobOutcome::Done)]);

        assert!(process_next_job(&pool, &handler, &settings(3)).await.unwrap());
        assert_eq!(db::count_jobs(&pool).await.unwrap(), 0);
        assert!(!process_next_job(&pool, &handler, &settings(3)).await.unwrap());
    }

    #[tokio::test]
    async fn retry_is_not_a_failed_attempt() {
        let pool = db::memory_pool().await.unwrap();
        SqliteQueue::new(pool.clone()).enqueue(&job(), None).await.unwrap();
        let handler =
            ScriptedHandler::new(vec![Ok(JobOutcome::Retry(Duration::from_secs(3600)))]);

        assert!(process_next_job(&pool, &handler, &settings(3)).await.unwrap());
        let jobs = db::list_jobs(&pool).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 0);
        // redelivery delay capped at 900s; not due yet
        assert!(!process_next_job(&pool, &handler, &settings(3)).await.unwrap());
    }

    #[tokio::test]
    async fn final_failure_runs_cleanup_and_dead_letters() {
        let pool = db::memory_pool().await.unwrap();
        SqliteQueue::new(pool.clone()).enqueue(&job(), None).await.unwrap();
        let handler = ScriptedHandler::new(vec![Err(anyhow!("boom"))]);

        assert!(process_next_job(&pool, &handler, &settings(1)).await.unwrap());
        assert_eq!(db::count_jobs(&pool).await.unwrap(), 0);
        assert_eq!(db::count_dead_jobs(&pool).await.unwrap(), 1);
        assert_eq!(*handler.dead.lock().unwrap(), vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn earlier_failures_back_off() {
        let pool = db::memory_pool().await.unwrap();
        SqliteQueue::new(pool.clone()).enqueue(&job(), None).await.unwrap();
        let handler = ScriptedHandler::new(vec![Err(anyhow!("boom"))]);

        assert!(process_next_job(&pool, &handler, &settings(3)).await.unwrap());
        let jobs = db::list_jobs(&pool).await.unwrap();
        assert_eq!(jobs[0].attempt, 1);
        assert!(handler.dead.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escaped_rate_limit_is_redelivered() {
        let pool = db::memory_pool().await.unwrap();
        SqliteQueue::new(pool.clone()).enqueue(&job(), None).await.unwrap();
        let handler = ScriptedHandler::new(vec![Err(anyhow::Error::new(
            SyncError::RateLimited(Duration::from_secs(20)),
        ))]);

        assert!(process_next_job(&pool, &handler, &settings(1)).await.unwrap());
        let jobs = db::list_jobs(&pool).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 0);
        assert_eq!(db::count_dead_jobs(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let pool = db::memory_pool().await.unwrap();
        let due = Utc::now().timestamp_millis();
        db::enqueue_job(&pool, "acme", "{not json", due).await.unwrap();
        let handler = ScriptedHandler::new(vec![]);

        assert!(process_next_job(&pool, &handler, &settings(3)).await.unwrap());
        assert_eq!(db::count_dead_jobs(&pool).await.unwrap(), 1);
    }
}
