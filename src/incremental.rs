//! Incremental sync: fetch what changed since the last successful run.
use crate::cursor::Walk;
use crate::error::SyncResult;
use crate::model::TimeWindow;
use crate::window::{Volumes, WindowWalker};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalReport {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub volumes: Volumes,
    pub index_requests: usize,
}

/// Run one incremental pass for `(synced_until, now)`.
///
/// Without a synced-until marker the pass covers the provider's initial
/// window. Identities are always refreshed. Every record created or updated
/// inside the pass is indexed, including edits to records created long ago. The marker advances to `now`
/// (the run's start) only after indexing was triggered; a failed run leaves
/// it untouched.
#[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %walker.provider()))]
pub async fn run_incremental(
    walker: &WindowWalker,
    tenant_id: &str,
    suppress_notification: bool,
    now: DateTime<Utc>,
) -> SyncResult<IncrementalReport> {
    let provider = walker.provider();
    let cursors = walker.cursors();
    let since = match cursors.synced_until(tenant_id, provider).await? {
        Some(ts) if ts <= now => ts,
        Some(ts) => {
            info!(%ts, "synced-until is in the future; nothing to do");
            return Ok(IncrementalReport {
                since: ts,
                until: now,
                volumes: Volumes::default(),
                index_requests: 0,
            });
        }
        None => now - walker.settings().initial_window(),
    };

    let window = TimeWindow::new(since, None);
    let volumes = walker
        .execute(tenant_id, &window, now, Walk::Incremental, true)
        .await?;
    let index_requests = walker
        .index_changed(tenant_id, since, now, None, suppress_notification)
        .await?;
    cursors
        .clear_progress(tenant_id, provider, Walk::Incremental)
        .await?;
    cursors.advance_synced_until(tenant_id, provider, now).await?;

    info!(
        %since,
        until = %now,
        records = volumes.total(),
        index_requests,
        "incremental sync complete"
    );
    Ok(IncrementalReport {
        since,
        until: now,
        volumes,
        index_requests,
    })
}
