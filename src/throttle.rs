//! Assigns dispatch times to batches from a provider's burst and sustained
//! rate limits. One implementation serves every provider; providers only
//! contribute their constants.
use crate::config::ProviderConfig;
use crate::model::Batch;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub batch_size: usize,
    /// Units that may be fetched right away before the sustained rate applies.
    pub burst_capacity: usize,
    /// Units per hour once the burst is spent.
    pub sustained_rate_per_hour: u32,
}

impl RateLimits {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            burst_capacity: cfg.burst_capacity,
            sustained_rate_per_hour: cfg.sustained_rate_per_hour,
        }
    }

    /// Number of leading batches dispatched immediately.
    pub fn burst_count(&self, total_batches: usize) -> usize {
        total_batches.min(self.burst_capacity / self.batch_size.max(1))
    }

    /// Spacing between throttled batches: `batch_size * 3600 / rate` seconds,
    /// at millisecond precision and never zero.
    pub fn per_batch_delay(&self) -> Duration {
        let rate = i64::from(self.sustained_rate_per_hour.max(1));
        let millis = (self.batch_size as i64) * 3_600_000 / rate;
        Duration::milliseconds(millis.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBatch {
    pub batch: Batch,
    /// `None` means dispatch immediately.
    pub start_timestamp: Option<DateTime<Utc>>,
}

/// Assign start timestamps. The first `burst_count` batches (by index) get
/// none; the rest are spaced evenly from `base_time`.
pub fn schedule(
    batches: Vec<Batch>,
    limits: &RateLimits,
    base_time: DateTime<Utc>,
) -> Vec<ScheduledBatch> {
    let burst = limits.burst_count(batches.len());
    let delay = limits.per_batch_delay();
    batches
        .into_iter()
        .enumerate()
        .map(|(i, batch)| {
            let start_timestamp = if i < burst {
                None
            } else {
                Some(base_time + delay * (i - burst) as i32)
            };
            ScheduledBatch {
                batch,
                start_timestamp,
            }
        })
        .collect()
}

/// When the last scheduled batch becomes due.
pub fn last_dispatch(scheduled: &[ScheduledBatch]) -> Option<DateTime<Utc>> {
    scheduled.iter().filter_map(|s| s.start_timestamp).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkUnit;
    use crate::partition::partition;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn batches(n_units: usize, size: usize) -> Vec<Batch> {
        partition(
            (0..n_units).map(|i| WorkUnit::new(format!("f{i}"))).collect(),
            size,
        )
    }

    #[test]
    fn scenario_a_one_burst_batch() {
        let limits = RateLimits {
            batch_size: 10,
            burst_capacity: 15,
            sustained_rate_per_hour: 600,
        };
        let out = schedule(batches(23, 10), &limits, base());
        assert_eq!(limits.burst_count(3), 1);
        assert_eq!(out[0].start_timestamp, None);
        // 10 * 3600 / 600 = 60s apart
        assert_eq!(out[1].start_timestamp, Some(base()));
        assert_eq!(out[2].start_timestamp, Some(base() + Duration::seconds(60)));
    }

    #[test]
    fn burst_covers_everything() {
        let limits = RateLimits {
            batch_size: 10,
            burst_capacity: 1000,
            sustained_rate_per_hour: 60,
        };
        let out = schedule(batches(95, 10), &limits, base());
        assert!(out.iter().all(|s| s.start_timestamp.is_none()));
        assert_eq!(last_dispatch(&out), None);
    }

    #[test]
    fn zero_burst_throttles_from_first_batch() {
        let limits = RateLimits {
            batch_size: 10,
            burst_capacity: 5,
            sustained_rate_per_hour: 3600,
        };
        let out = schedule(batches(30, 10), &limits, base());
        assert_eq!(out[0].start_timestamp, Some(base()));
        assert_eq!(out[2].start_timestamp, Some(base() + Duration::seconds(20)));
    }

    #[test]
    fn timestamps_evenly_spaced_and_non_decreasing() {
        let limits = RateLimits {
            batch_size: 7,
            burst_capacity: 20,
            sustained_rate_per_hour: 1000,
        };
        let out = schedule(batches(200, 7), &limits, base());
        let burst = limits.burst_count(out.len());
        assert_eq!(burst, 2);
        assert!(out[..burst].iter().all(|s| s.start_timestamp.is_none()));

        let ts: Vec<_> = out[burst..]
            .iter()
            .map(|s| s.start_timestamp.unwrap())
            .collect();
        let step = ts[1] - ts[0];
        assert_eq!(step, Duration::milliseconds(25_200));
        for w in ts.windows(2) {
            assert!(w[0] < w[1]);
            assert_eq!(w[1] - w[0], step);
        }
        // null or <= for any i < j
        for i in 0..out.len() {
            for j in i + 1..out.len() {
                if let (Some(a), Some(b)) = (out[i].start_timestamp, out[j].start_timestamp) {
                    assert!(a <= b);
                } else if out[j].start_timestamp.is_none() {
                    assert!(out[i].start_timestamp.is_none());
                }
            }
        }
    }
}
