//! Deferred dispatch: the "not due yet, redeliver me later" contract every
//! job handler honours.
//!
//! A handler never sleeps until its start time. It returns
//! [`JobOutcome::Retry`] and the transport redelivers it; waits longer than the
//! transport's maximum delay simply take several hops.
use crate::config;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of one delivery that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work finished; acknowledge and delete the message.
    Done,
    /// Not an error: redeliver after the given delay.
    Retry(Duration),
}

impl JobOutcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, JobOutcome::Retry(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferPolicy {
    pub safety_buffer: Duration,
    pub max_delay: Duration,
}

impl DeferPolicy {
    pub fn new(safety_buffer: Duration, max_delay: Duration) -> Self {
        Self {
            safety_buffer,
            max_delay,
        }
    }

    pub fn from_config(queue: &config::Queue) -> Self {
        Self::new(queue.safety_buffer(), queue.max_redelivery_delay())
    }

    /// How long a job with `start_timestamp` must still wait, or `None` when
    /// it is due. The wait includes the safety buffer and is capped.
    pub fn defer_for(
        &self,
        start_timestamp: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let start = start_timestamp?;
        if start <= now {
            return None;
        }
        let remaining = (start - now).to_std().unwrap_or_default();
        Some(self.cap(remaining + self.safety_buffer))
    }

    pub fn cap(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }

    /// Outcome for a provider rate-limit signal.
    pub fn rate_limited(&self, retry_after: Duration) -> JobOutcome {
        JobOutcome::Retry(self.cap(retry_after + self.safety_buffer))
    }
}
