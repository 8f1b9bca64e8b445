//! Root planning: turns "backfill everything" into queued jobs.
use crate::config::Config;
use crate::model::{
    BatchJob, IncrementalJob, IndexDoneJob, JobPayload, Provider, ScheduledJob, TimeWindow, WindowJob, WorkUnit,
};
use crate::partition::{dedupe, partition};
use crate::progress::ProgressTracker;
use crate::queue::JobQueue;
use crate::throttle::{last_dispatch, schedule, RateLimits};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Keep the units whose grouping key is one of the tenant's selected scopes.
/// `None` keeps everything. Ungrouped units cannot be scoped and are kept.
pub fn filter_to_scope(units: Vec<WorkUnit>, scope: Option<&[String]>) -> Vec<WorkUnit> {
    let Some(scope) = scope else {
        return units;
    };
    units
        .into_iter()
        .filter(|u| match &u.group {
            Some(group) => scope.iter().any(|s| s == group),
            None => true,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub backfill_id: Uuid,
    pub total_batches: usize,
    pub burst_count: usize,
    pub last_dispatch: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Planner {
    config: Arc<Config>,
    tracker: ProgressTracker,
    queue: Arc<dyn JobQueue>,
}

impl Planner {
    pub fn new(config: Arc<Config>, tracker: ProgressTracker, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            config,
            tracker,
            queue,
        }
    }

    /// Partition and schedule enumerated work units, then enqueue one job per
    /// batch in index order. The run's total is recorded before the first
    /// job is emitted.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %provider))]
    pub async fn plan_batch_backfill(
        &self,
        tenant_id: &str,
        provider: Provider,
        units: Vec<WorkUnit>,
        suppress_notification: bool,
        base_time: DateTime<Utc>,
    ) -> Result<BatchPlan> {
        let cfg = self
            .config
            .provider(provider)
            .ok_or_else(|| anyhow!("provider {provider} is not configured"))?;
        let scope = self.config.tenant(tenant_id).and_then(|t| t.scope(provider));
        let enumerated = units.len();
        let units = dedupe(filter_to_scope(units, scope));
        if units.is_empty() {
            bail!("no work units in scope for {tenant_id}/{provider} ({enumerated} enumerated)");
        }

        let limits = RateLimits::from_config(cfg);
        let scheduled = schedule(partition(units, cfg.batch_size), &limits, base_time);
        let total_batches = scheduled.len();

        let backfill_id = self
            .tracker
            .start_run(tenant_id, provider, suppress_notification)
            .await?;
        self.tracker
            .increment_total_ingest_jobs(backfill_id, tenant_id, total_batches as i64)
            .await?;

        for item in &scheduled {
            let job = ScheduledJob {
                tenant_id: tenant_id.to_string(),
                backfill_id: Some(backfill_id),
                suppress_notification,
                start_timestamp: item.start_timestamp,
                payload: JobPayload::Batch(BatchJob {
                    provider,
                    batch: item.batch.clone(),
                }),
            };
            self.queue.enqueue(&job, None).await?;
        }

        let plan = BatchPlan {
            backfill_id,
            total_batches,
            burst_count: limits.burst_count(total_batches),
            last_dispatch: last_dispatch(&scheduled),
        };
        info!(
            %backfill_id,
            total_batches,
            burst = plan.burst_count,
            last_dispatch = ?plan.last_dispatch,
            "batch backfill planned"
        );
        Ok(plan)
    }

    /// Start a window-based backfill at "now": the first window is open-ended
    /// and spans the provider's initial window size.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %provider))]
    pub async fn start_window_backfill(
        &self,
        tenant_id: &str,
        provider: Provider,
        suppress_notification: bool,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let settings = self
            .config
            .provider(provider)
            .and_then(|c| c.window.as_ref())
            .ok_or_else(|| anyhow!("provider {provider} has no window settings"))?;

        let backfill_id = self
            .tracker
            .start_run(tenant_id, provider, suppress_notification)
            .await?;
        self.tracker
            .increment_total_ingest_jobs(backfill_id, tenant_id, 1)
            .await?;

        let window = TimeWindow::new(now - settings.initial_window(), None);
        let job = ScheduledJob {
            tenant_id: tenant_id.to_string(),
            backfill_id: Some(backfill_id),
            suppress_notification,
            start_timestamp: None,
            payload: JobPayload::Window(WindowJob {
                provider,
                window,
                force_refetch: false,
            }),
        };
        self.queue.enqueue(&job, None).await?;
        info!(%backfill_id, start = %window.start, "window backfill started");
        Ok(backfill_id)
    }

    /// Queue one incremental pass for a tenant and provider.
    pub async fn enqueue_incremental(
        &self,
        tenant_id: &str,
        provider: Provider,
        suppress_notification: bool,
    ) -> Result<()> {
        if self.config.provider(provider).and_then(|c| c.window.as_ref()).is_none() {
            bail!("provider {provider} has no window settings");
        }
        let job = ScheduledJob {
            tenant_id: tenant_id.to_string(),
            backfill_id: None,
            suppress_notification,
            start_timestamp: None,
            payload: JobPayload::Incremental(IncrementalJob { provider }),
        };
        self.queue.enqueue(&job, None).await?;
        info!(tenant_id, %provider, "incremental sync queued");
        Ok(())
    }

    /// Queue an acknowledgement of `count` finished index jobs of a run.
    pub async fn enqueue_index_done(&self, tenant_id: &str, backfill_id: Uuid, count: u32) -> Result<()> {
        if count == 0 {
            bail!("index-done count must be positive");
        }
        let run = self
            .tracker
            .get(backfill_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow!("no backfill {backfill_id} for tenant {tenant_id}"))?;
        let job = ScheduledJob {
            tenant_id: tenant_id.to_string(),
            backfill_id: Some(backfill_id),
            suppress_notification: run.suppress_notification,
            start_timestamp: None,
            payload: JobPayload::IndexDone(IndexDoneJob {
                provider: run.provider,
                count,
            }),
        };
        self.queue.enqueue(&job, None).await?;
        info!(tenant_id, %backfill_id, count, "index acknowledgement queued");
        Ok(())
    }
}
