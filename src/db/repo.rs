use super::model::{Counter, QueuedJobRow, StoredRecordRef};
use crate::model::{BackfillRun, Identity, Provider, Record};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

/// SQLite caps bound parameters per statement; stay well below it.
const MAX_IN_LIST: usize = 500;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool with the schema applied.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Create the file on first open; the rest of the query string is kept.
    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(tenant_id = %tenant_id, key = %key))]
pub async fn get_cursor(pool: &Pool, tenant_id: &str, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT value FROM sync_cursors WHERE tenant_id = ? AND cursor_key = ?",
    )
    .bind(tenant_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

#[instrument(skip_all, fields(tenant_id = %tenant_id, key = %key))]
pub async fn set_cursor(pool: &Pool, tenant_id: &str, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_cursors (tenant_id, cursor_key, value) VALUES (?, ?, ?) \
         ON CONFLICT(tenant_id, cursor_key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(tenant_id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(tenant_id = %tenant_id, key = %key))]
pub async fn clear_cursor(pool: &Pool, tenant_id: &str, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_cursors WHERE tenant_id = ? AND cursor_key = ?")
        .bind(tenant_id)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Cursor keys of a tenant starting with `prefix`.
pub async fn list_cursor_keys(pool: &Pool, tenant_id: &str, prefix: &str) -> Result<Vec<String>> {
    let keys = sqlx::query_scalar::<_, String>(
        "SELECT cursor_key FROM sync_cursors WHERE tenant_id = ? AND substr(cursor_key, 1, ?) = ? ORDER BY cursor_key",
    )
    .bind(tenant_id)
    .bind(prefix.len() as i64)
    .bind(prefix)
    .fetch_all(pool)
    .await?;
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Backfill runs
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(backfill_id = %backfill_id, tenant_id = %tenant_id))]
pub async fn create_backfill_run(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
    provider: Provider,
    suppress_notification: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO backfill_runs (backfill_id, tenant_id, provider, suppress_notification) VALUES (?, ?, ?, ?)",
    )
    .bind(backfill_id.to_string())
    .bind(tenant_id)
    .bind(provider.as_str())
    .bind(suppress_notification)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_backfill_run(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
) -> Result<Option<BackfillRun>> {
    let row = sqlx::query("SELECT * FROM backfill_runs WHERE backfill_id = ? AND tenant_id = ?")
        .bind(backfill_id.to_string())
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

pub async fn list_backfill_runs(pool: &Pool, tenant_id: &str) -> Result<Vec<BackfillRun>> {
    let rows = sqlx::query("SELECT * FROM backfill_runs WHERE tenant_id = ? ORDER BY created_at DESC")
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(run_from_row).collect()
}

/// Atomically add `n` to one counter and return the updated run.
///
/// The addition happens inside a single UPDATE, so concurrent callers never
/// lose increments.
#[instrument(skip_all, fields(backfill_id = %backfill_id, tenant_id = %tenant_id, counter = counter.column(), n = n))]
pub async fn increment_counter(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
    counter: Counter,
    n: i64,
) -> Result<BackfillRun> {
    if n < 0 {
        return Err(anyhow!("counters never decrease (got {n})"));
    }
    let col = counter.column();
    let sql = format!(
        "UPDATE backfill_runs SET {col} = {col} + ? WHERE backfill_id = ? AND tenant_id = ? RETURNING *"
    );
    let row = sqlx::query(&sql)
        .bind(n)
        .bind(backfill_id.to_string())
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => run_from_row(&row),
        None => Err(anyhow!("unknown backfill {backfill_id} for tenant {tenant_id}")),
    }
}

/// Register the continuation window starting at `window_start` and count it
/// towards the run's ingest total. Registration and count happen once per
/// `(run, window start)`, however often the parent window is redelivered.
/// Returns true while the continuation has not been enqueued yet.
#[instrument(skip_all, fields(backfill_id = %backfill_id, tenant_id = %tenant_id, window_start = %window_start))]
pub async fn claim_window_continuation(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
    window_start: DateTime<Utc>,
) -> Result<bool> {
    let id = backfill_id.to_string();
    let start_ms = window_start.timestamp_millis();
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO window_continuations (backfill_id, tenant_id, window_start_ms) VALUES (?, ?, ?)",
    )
    .bind(&id)
    .bind(tenant_id)
    .bind(start_ms)
    .execute(&mut *tx)
    .await?;
    if inserted.rows_affected() == 1 {
        let counted = sqlx::query(
            "UPDATE backfill_runs SET total_ingest_jobs = total_ingest_jobs + 1 \
             WHERE backfill_id = ? AND tenant_id = ?",
        )
        .bind(&id)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() == 0 {
            return Err(anyhow!("unknown backfill {backfill_id} for tenant {tenant_id}"));
        }
    }
    let enqueued = sqlx::query_scalar::<_, i64>(
        "SELECT enqueued FROM window_continuations \
         WHERE backfill_id = ? AND tenant_id = ? AND window_start_ms = ?",
    )
    .bind(&id)
    .bind(tenant_id)
    .bind(start_ms)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(enqueued == 0)
}

pub async fn mark_window_continuation_enqueued(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
    window_start: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE window_continuations SET enqueued = 1 \
         WHERE backfill_id = ? AND tenant_id = ? AND window_start_ms = ?",
    )
    .bind(backfill_id.to_string())
    .bind(tenant_id)
    .bind(window_start.timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a run completed if it is complete and nobody marked it before.
/// Returns true for exactly one caller per run.
#[instrument(skip_all, fields(backfill_id = %backfill_id, tenant_id = %tenant_id))]
pub async fn claim_completion(
    pool: &Pool,
    backfill_id: Uuid,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE backfill_runs SET completed_at = ? \
         WHERE backfill_id = ? AND tenant_id = ? AND completed_at IS NULL \
           AND total_ingest_jobs > 0 \
           AND attempted_ingest_jobs = total_ingest_jobs \
           AND done_index_jobs = total_index_jobs",
    )
    .bind(now)
    .bind(backfill_id.to_string())
    .bind(tenant_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn run_from_row(row: &SqliteRow) -> Result<BackfillRun> {
    let id: String = row.try_get("backfill_id")?;
    let provider: String = row.try_get("provider")?;
    Ok(BackfillRun {
        backfill_id: Uuid::parse_str(&id).with_context(|| format!("bad backfill id {id}"))?,
        tenant_id: row.try_get("tenant_id")?,
        provider: provider.parse().map_err(|e: String| anyhow!(e))?,
        suppress_notification: row.try_get("suppress_notification")?,
        total_ingest_jobs: row.try_get("total_ingest_jobs")?,
        attempted_ingest_jobs: row.try_get("attempted_ingest_jobs")?,
        done_ingest_jobs: row.try_get("done_ingest_jobs")?,
        total_index_jobs: row.try_get("total_index_jobs")?,
        done_index_jobs: row.try_get("done_index_jobs")?,
        completed_at: row.try_get("completed_at")?,
    })
}

// ---------------------------------------------------------------------------
// Records and identities
// ---------------------------------------------------------------------------

/// Insert or refresh records. The original creation time is kept on conflict.
#[instrument(skip_all, fields(tenant_id = %tenant_id, count = records.len()))]
pub async fn upsert_records(pool: &Pool, tenant_id: &str, records: &[Record]) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut written = 0;
    for r in records {
        let refs = serde_json::to_string(&r.identity_refs)?;
        let payload = serde_json::to_string(&r.payload)?;
        let res = sqlx::query(
            "INSERT INTO records (tenant_id, source_type, external_id, created_at_ms, updated_at_ms, identity_refs, payload) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, source_type, external_id) DO UPDATE SET \
               updated_at_ms = excluded.updated_at_ms, identity_refs = excluded.identity_refs, \
               payload = excluded.payload, stored_at = CURRENT_TIMESTAMP",
        )
        .bind(tenant_id)
        .bind(&r.source_type)
        .bind(&r.external_id)
        .bind(r.created_at.timestamp_millis())
        .bind(r.updated_at.timestamp_millis())
        .bind(refs)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        written += res.rows_affected();
    }
    tx.commit().await?;
    Ok(written)
}

/// Records of a tenant created within `[start, end]`, oldest first.
#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn records_created_between(
    pool: &Pool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<StoredRecordRef>> {
    let rows = sqlx::query(
        "SELECT source_type, external_id FROM records \
         WHERE tenant_id = ? AND created_at_ms >= ? AND created_at_ms <= ? \
         ORDER BY created_at_ms ASC, source_type, external_id",
    )
    .bind(tenant_id)
    .bind(start.timestamp_millis())
    .bind(end.timestamp_millis())
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_ref_from_row).collect())
}

/// Records of a tenant created or updated within `[start, end]`.
#[instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn records_changed_between(
    pool: &Pool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<StoredRecordRef>> {
    let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
    let rows = sqlx::query(
        "SELECT source_type, external_id FROM records \
         WHERE tenant_id = ? \
           AND ((created_at_ms >= ? AND created_at_ms <= ?) OR (updated_at_ms >= ? AND updated_at_ms <= ?)) \
         ORDER BY created_at_ms ASC, source_type, external_id",
    )
    .bind(tenant_id)
    .bind(start_ms)
    .bind(end_ms)
    .bind(start_ms)
    .bind(end_ms)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_ref_from_row).collect())
}

fn record_ref_from_row(row: &SqliteRow) -> StoredRecordRef {
    StoredRecordRef {
        source_type: row.get("source_type"),
        external_id: row.get("external_id"),
    }
}

pub async fn count_records(pool: &Pool, tenant_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE tenant_id = ?")
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Subset of `ids` already stored (and not deleted) for a tenant/provider.
#[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %provider, asked = ids.len()))]
pub async fn known_identity_ids(
    pool: &Pool,
    tenant_id: &str,
    provider: Provider,
    ids: &[String],
) -> Result<HashSet<String>> {
    let mut known = HashSet::new();
    for chunk in ids.chunks(MAX_IN_LIST) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT identity_id FROM identities WHERE tenant_id = ");
        qb.push_bind(tenant_id)
            .push(" AND provider = ")
            .push_bind(provider.as_str())
            .push(" AND deleted = 0 AND identity_id IN (");
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(id.as_str());
        }
        sep.push_unseparated(")");
        let found: Vec<String> = qb.build_query_scalar().fetch_all(pool).await?;
        known.extend(found);
    }
    Ok(known)
}

#[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %provider, count = identities.len()))]
pub async fn upsert_identities(
    pool: &Pool,
    tenant_id: &str,
    provider: Provider,
    identities: &[Identity],
) -> Result<()> {
    if identities.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for identity in identities {
        sqlx::query(
            "INSERT INTO identities (tenant_id, provider, identity_id, payload, deleted) VALUES (?, ?, ?, ?, 0) \
             ON CONFLICT(tenant_id, provider, identity_id) DO UPDATE SET \
               payload = excluded.payload, deleted = 0, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .bind(&identity.id)
        .bind(serde_json::to_string(&identity.payload)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Flag identities the provider no longer returns.
#[instrument(skip_all, fields(tenant_id = %tenant_id, provider = %provider, count = ids.len()))]
pub async fn mark_identities_deleted(
    pool: &Pool,
    tenant_id: &str,
    provider: Provider,
    ids: &[String],
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query(
            "INSERT INTO identities (tenant_id, provider, identity_id, deleted) VALUES (?, ?, ?, 1) \
             ON CONFLICT(tenant_id, provider, identity_id) DO UPDATE SET deleted = 1, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(tenant_id = %tenant_id, due_at_ms = due_at_ms))]
pub async fn enqueue_job(
    pool: &Pool,
    tenant_id: &str,
    payload: &str,
    due_at_ms: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO jobs (tenant_id, payload, attempt, due_at_ms) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(tenant_id)
    .bind(payload)
    .bind(due_at_ms)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Lease the oldest due job until `lease_until_ms`. While leased the job is
/// invisible to other workers; if the worker dies it becomes due again.
#[instrument(skip_all)]
pub async fn claim_next_job(
    pool: &Pool,
    now_ms: i64,
    lease_until_ms: i64,
) -> Result<Option<QueuedJobRow>> {
    let row = sqlx::query(
        "UPDATE jobs SET due_at_ms = ? \
         WHERE id = (SELECT id FROM jobs WHERE due_at_ms <= ? ORDER BY due_at_ms ASC, id ASC LIMIT 1) \
         RETURNING id, tenant_id, payload, attempt",
    )
    .bind(lease_until_ms)
    .bind(now_ms)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| QueuedJobRow {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all, fields(id = id))]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Make a job due again at `due_at_ms` without counting a failed attempt.
#[instrument(skip_all, fields(id = id, due_at_ms = due_at_ms))]
pub async fn redeliver_job_at(pool: &Pool, id: i64, due_at_ms: i64) -> Result<()> {
    sqlx::query("UPDATE jobs SET due_at_ms = ? WHERE id = ?")
        .bind(due_at_ms)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff after a failed delivery: 5s * 2^attempt, capped at
/// `max_cap_secs` (or 3600s when no cap is configured).
#[instrument(skip_all, fields(id = id, attempt = attempt))]
pub async fn backoff_job_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    now_ms: i64,
) -> Result<i64> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query("UPDATE jobs SET attempt = ?, due_at_ms = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(now_ms + secs * 1000)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(secs)
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    secs.min(cap)
}

/// Move a job to `dead_jobs` after its final failed delivery.
#[instrument(skip_all, fields(id = id))]
pub async fn dead_letter_job(pool: &Pool, id: i64, last_error: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO dead_jobs (id, tenant_id, payload, attempt, last_error) \
         SELECT id, tenant_id, payload, attempt + 1, ? FROM jobs WHERE id = ?",
    )
    .bind(last_error)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_dead_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// All queued jobs in emission order, including leased ones.
pub async fn list_jobs(pool: &Pool) -> Result<Vec<QueuedJobRow>> {
    let rows = sqlx::query("SELECT id, tenant_id, payload, attempt FROM jobs ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| QueuedJobRow {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            payload: row.get("payload"),
            attempt: row.get("attempt"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, created: DateTime<Utc>) -> Record {
        Record {
            source_type: "zendesk_ticket".into(),
            external_id: id.into(),
            created_at: created,
            updated_at: created,
            identity_refs: vec![],
            payload: serde_json::json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn test_cursor_set_get_clear() {
        let pool = memory_pool().await.unwrap();
        assert!(get_cursor(&pool, "t1", "k").await.unwrap().is_none());
        set_cursor(&pool, "t1", "k", "v1").await.unwrap();
        set_cursor(&pool, "t1", "k", "v2").await.unwrap();
        assert_eq!(get_cursor(&pool, "t1", "k").await.unwrap().as_deref(), Some("v2"));
        // tenant scoped
        assert!(get_cursor(&pool, "t2", "k").await.unwrap().is_none());
        clear_cursor(&pool, "t1", "k").await.unwrap();
        clear_cursor(&pool, "t1", "k").await.unwrap();
        assert!(get_cursor(&pool, "t1", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_range_keeps_creation_time() {
        let pool = memory_pool().await.unwrap();
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap();
        upsert_records(&pool, "t1", &[record("a", day(1)), record("b", day(5)), record("c", day(9))])
            .await
            .unwrap();
        // re-upsert with a different creation time must not move the record
        upsert_records(&pool, "t1", &[record("a", day(6))]).await.unwrap();

        let refs = records_created_between(&pool, "t1", day(2), day(9)).await.unwrap();
        let ids: Vec<_> = refs.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(count_records(&pool, "t1").await.unwrap(), 3);
        assert!(records_created_between(&pool, "t2", day(1), day(9))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_changed_range_includes_updates_of_old_records() {
        let pool = memory_pool().await.unwrap();
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap();
        let mut touched = record("old", day(1));
        touched.updated_at = day(8);
        upsert_records(&pool, "t1", &[touched, record("stale", day(2)), record("new", day(7))])
            .await
            .unwrap();

        let ids: Vec<_> = records_changed_between(&pool, "t1", day(6), day(9))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        assert_eq!(ids, vec!["old", "new"]);
        let created: Vec<_> = records_created_between(&pool, "t1", day(6), day(9))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        assert_eq!(created, vec!["new"]);
    }

    #[tokio::test]
    async fn test_window_continuation_counted_once() {
        let pool = memory_pool().await.unwrap();
        let id = Uuid::new_v4();
        create_backfill_run(&pool, id, "t1", Provider::Zendesk, false)
            .await
            .unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert!(claim_window_continuation(&pool, id, "t1", start).await.unwrap());
        // redelivered before the enqueue went through
        assert!(claim_window_continuation(&pool, id, "t1", start).await.unwrap());
        mark_window_continuation_enqueued(&pool, id, "t1", start)
            .await
            .unwrap();
        assert!(!claim_window_continuation(&pool, id, "t1", start).await.unwrap());

        let run = get_backfill_run(&pool, id, "t1").await.unwrap().unwrap();
        assert_eq!(run.total_ingest_jobs, 1);

        let err = claim_window_continuation(&pool, Uuid::new_v4(), "t1", start)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown backfill"));
    }

    #[tokio::test]
    async fn test_queue_lease_and_dead_letter() {
        let pool = memory_pool().await.unwrap();
        let id = enqueue_job(&pool, "t1", "{}", 1_000).await.unwrap();
        assert!(claim_next_job(&pool, 999, 5_000).await.unwrap().is_none());

        let job = claim_next_job(&pool, 1_000, 5_000).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        // leased: invisible until the lease runs out
        assert!(claim_next_job(&pool, 4_999, 9_000).await.unwrap().is_none());
        assert!(claim_next_job(&pool, 5_000, 9_000).await.unwrap().is_some());

        dead_letter_job(&pool, id, "boom").await.unwrap();
        assert_eq!(count_jobs(&pool).await.unwrap(), 0);
        assert_eq!(count_dead_jobs(&pool).await.unwrap(), 1);
    }

    #[test]
    fn test_backoff_secs() {
        assert_eq!(backoff_secs(0, 300), 5);
        assert_eq!(backoff_secs(3, 300), 40);
        assert_eq!(backoff_secs(10, 300), 300);
        assert_eq!(backoff_secs(20, 0), 3600);
    }
}
