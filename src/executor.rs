//! Concurrency inside a single job invocation.
//!
//! Two shapes are supported:
//! - [`join_all_or_fail`]: a small fixed set of sub-tasks that succeed or fail
//!   together. The first error drops (cancels) the siblings still running.
//! - [`run_isolated`]: bounded fan-out over work units where one unit failing
//!   does not affect the others. A rate-limit signal stops new units from
//!   starting so the job can be redelivered later.
use crate::error::{SyncError, SyncResult};
use futures::future::{try_join_all, BoxFuture};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Run every task concurrently and wait for all of them; fail fast on the
/// first error. Results keep task order.
pub async fn join_all_or_fail<'a, T, E>(
    tasks: Vec<BoxFuture<'a, Result<T, E>>>,
) -> Result<Vec<T>, E> {
    try_join_all(tasks).await
}

#[derive(Debug)]
pub struct IsolatedReport<I, T> {
    pub succeeded: Vec<(I, T)>,
    pub failed: Vec<(I, SyncError)>,
    /// Units left for a later delivery: rate limited, or never started
    /// because another unit hit a rate limit.
    pub deferred: Vec<I>,
    /// Longest retry-after seen among rate-limited units.
    pub retry_after: Option<Duration>,
}

impl<I, T> IsolatedReport<I, T> {
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some()
    }
}

/// Run `f` for every item with at most `limit` in flight. Per-item errors are
/// collected instead of propagated; output order follows input order.
pub async fn run_isolated<I, T, F, Fut>(items: Vec<I>, limit: usize, f: F) -> IsolatedReport<I, T>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let halted = AtomicBool::new(false);
    let halted = &halted;
    let f = &f;

    let results: Vec<(I, Option<SyncResult<T>>)> = stream::iter(items)
        .map(|item| async move {
            if halted.load(Ordering::SeqCst) {
                return (item, None);
            }
            let res = f(item.clone()).await;
            if matches!(res, Err(SyncError::RateLimited(_))) {
                halted.store(true, Ordering::SeqCst);
            }
            (item, Some(res))
        })
        .buffered(limit.max(1))
        .collect()
        .await;

    let mut report = IsolatedReport {
        succeeded: Vec::new(),
        failed: Vec::new(),
        deferred: Vec::new(),
        retry_after: None,
    };
    for (item, res) in results {
        match res {
            Some(Ok(value)) => report.succeeded.push((item, value)),
            Some(Err(SyncError::RateLimited(after))) => {
                report.retry_after = Some(report.retry_after.map_or(after, |a| a.max(after)));
                report.deferred.push(item);
            }
            Some(Err(err)) => report.failed.push((item, err)),
            None => report.deferred.push(item),
        }
    }
    report
}
