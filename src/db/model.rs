//! Row and view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use serde::{Deserialize, Serialize};

/// Backfill counter columns. Each maps to exactly one column of `backfill_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    TotalIngestJobs,
    AttemptedIngestJobs,
    DoneIngestJobs,
    TotalIndexJobs,
    DoneIndexJobs,
}

impl Counter {
    pub fn column(&self) -> &'static str {
        match self {
            Counter::TotalIngestJobs => "total_ingest_jobs",
            Counter::AttemptedIngestJobs => "attempted_ingest_jobs",
            Counter::DoneIngestJobs => "done_ingest_jobs",
            Counter::TotalIndexJobs => "total_index_jobs",
            Counter::DoneIndexJobs => "done_index_jobs",
        }
    }
}

/// A job leased to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJobRow {
    pub id: i64,
    pub tenant_id: String,
    pub payload: String,
    pub attempt: i32,
}

/// Key of a stored record, as returned by time range queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredRecordRef {
    pub source_type: String,
    pub external_id: String,
}
