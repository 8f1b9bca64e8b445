use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// External system records are pulled from.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Figma,
    Jira,
    Linear,
    Zendesk,
    Hubspot,
    Intercom,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Figma => "figma",
            Provider::Jira => "jira",
            Provider::Linear => "linear",
            Provider::Zendesk => "zendesk",
            Provider::Hubspot => "hubspot",
            Provider::Intercom => "intercom",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "figma" => Ok(Provider::Figma),
            "jira" => Ok(Provider::Jira),
            "linear" => Ok(Provider::Linear),
            "zendesk" => Ok(Provider::Zendesk),
            "hubspot" => Ok(Provider::Hubspot),
            "intercom" => Ok(Provider::Intercom),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grouping key a work unit is partitioned by (project, team, board...).
pub type GroupKey = String;

/// One fetchable external record id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupKey>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: None,
        }
    }

    pub fn grouped(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: Some(group.into()),
        }
    }
}

/// Work units sharing a grouping key, bounded by the provider's batch size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub batch_index: u32,
    pub units: Vec<WorkUnit>,
}

/// Bounded historical slice. `end = None` means "up to now".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Upper bound of the window, resolving an open end to `now`.
    pub fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end.unwrap_or(now)
    }

    pub fn contains(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end_or(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchJob {
    pub provider: Provider,
    pub batch: Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowJob {
    pub provider: Provider,
    pub window: TimeWindow,
    #[serde(default)]
    pub force_refetch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncrementalJob {
    pub provider: Provider,
}

/// Acknowledgement from the indexing side that `count` index jobs of a run
/// finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDoneJob {
    pub provider: Provider,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Batch(BatchJob),
    Window(WindowJob),
    Incremental(IncrementalJob),
    IndexDone(IndexDoneJob),
}

impl JobPayload {
    pub fn provider(&self) -> Provider {
        match self {
            JobPayload::Batch(job) => job.provider,
            JobPayload::Window(job) => job.provider,
            JobPayload::Incremental(job) => job.provider,
            JobPayload::IndexDone(job) => job.provider,
        }
    }

    /// Whether the job counts towards a run's ingest counters.
    pub fn is_ingest(&self) -> bool {
        matches!(self, JobPayload::Batch(_) | JobPayload::Window(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Batch(_) => "batch",
            JobPayload::Window(_) => "window",
            JobPayload::Incremental(_) => "incremental",
            JobPayload::IndexDone(_) => "index_done",
        }
    }
}

/// One queue message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub tenant_id: String,
    #[serde(default)]
    pub backfill_id: Option<Uuid>,
    #[serde(default)]
    pub suppress_notification: bool,
    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,
    pub payload: JobPayload,
}

/// Counters of one logical backfill instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillRun {
    pub backfill_id: Uuid,
    pub tenant_id: String,
    pub provider: Provider,
    pub suppress_notification: bool,
    pub total_ingest_jobs: i64,
    pub attempted_ingest_jobs: i64,
    pub done_ingest_jobs: i64,
    pub total_index_jobs: i64,
    pub done_index_jobs: i64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackfillRun {
    pub fn is_complete(&self) -> bool {
        self.total_ingest_jobs > 0
            && self.attempted_ingest_jobs == self.total_ingest_jobs
            && self.done_index_jobs == self.total_index_jobs
    }

    /// Ingest jobs that have not reached a terminal delivery yet.
    pub fn pending_ingest_jobs(&self) -> i64 {
        (self.total_ingest_jobs - self.attempted_ingest_jobs).max(0)
    }
}

/// A record fetched from a provider, ready to upsert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub source_type: String,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub identity_refs: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

/// A user/contact record referenced by other records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}
