use anyhow::{anyhow, Context, Result};
use backfill_engine::config;
use backfill_engine::cursor::CursorStore;
use backfill_engine::db;
use backfill_engine::indexing::HttpIndexer;
use backfill_engine::jobs::JobRunner;
use backfill_engine::model::{BackfillRun, Provider, WorkUnit};
use backfill_engine::planner::Planner;
use backfill_engine::progress::{LogNotifier, ProgressTracker};
use backfill_engine::provider::ProviderRegistry;
use backfill_engine::queue::{self, SqliteQueue, WorkerSettings};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(author, version, about = "Plan, run and inspect provider backfills")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan a batch backfill from a JSON-lines file of work units
    Plan {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_enum)]
        provider: Provider,
        /// One `{"id": "...", "group": "..."}` object per line
        #[arg(long)]
        units: PathBuf,
        #[arg(long)]
        suppress_notification: bool,
    },
    /// Start a window-based backfill at the current time
    StartWindow {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_enum)]
        provider: Provider,
        #[arg(long)]
        suppress_notification: bool,
    },
    /// Queue one incremental sync pass
    Incremental {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_enum)]
        provider: Provider,
    },
    /// Acknowledge finished index jobs of a backfill
    IndexDone {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        backfill_id: Uuid,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show backfill counters and queue depth
    Status {
        #[arg(long)]
        tenant: String,
        /// Only this run; all runs of the tenant otherwise
        #[arg(long)]
        backfill_id: Option<Uuid>,
    },
    /// Set or clear a provider's synced-until cursor
    ResetCursor {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_enum)]
        provider: Provider,
        /// RFC 3339 timestamp; clears the cursor when omitted
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Drain the job queue
    Worker,
    /// Print an example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = Arc::new(config::load(Some(&args.config))?);
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let tracker = ProgressTracker::new(pool.clone(), Arc::new(LogNotifier));
    let job_queue = Arc::new(SqliteQueue::new(pool.clone()));
    let planner = Planner::new(cfg.clone(), tracker.clone(), job_queue.clone());

    match args.command {
        Command::Plan {
            tenant,
            provider,
            units,
            suppress_notification,
        } => {
            let units = read_units(&units).await?;
            let plan = planner
                .plan_batch_backfill(&tenant, provider, units, suppress_notification, Utc::now())
                .await?;
            println!("backfill_id: {}", plan.backfill_id);
            println!("batches: {} (burst {})", plan.total_batches, plan.burst_count);
            if let Some(last) = plan.last_dispatch {
                println!("last batch due: {}", last.to_rfc3339());
            }
        }
        Command::StartWindow {
            tenant,
            provider,
            suppress_notification,
        } => {
            let id = planner
                .start_window_backfill(&tenant, provider, suppress_notification, Utc::now())
                .await?;
            println!("backfill_id: {id}");
        }
        Command::Incremental { tenant, provider } => {
            planner.enqueue_incremental(&tenant, provider, false).await?;
        }
        Command::IndexDone {
            tenant,
            backfill_id,
            count,
        } => {
            planner.enqueue_index_done(&tenant, backfill_id, count).await?;
        }
        Command::Status {
            tenant,
            backfill_id,
        } => {
            let runs = match backfill_id {
                Some(id) => vec![tracker
                    .get(id, &tenant)
                    .await?
                    .ok_or_else(|| anyhow!("no backfill {id} for tenant {tenant}"))?],
                None => db::list_backfill_runs(&pool, &tenant).await?,
            };
            for run in &runs {
                print_run(run);
            }
            println!(
                "queue: {} pending, {} dead",
                db::count_jobs(&pool).await?,
                db::count_dead_jobs(&pool).await?
            );
        }
        Command::ResetCursor {
            tenant,
            provider,
            to,
        } => {
            CursorStore::new(pool.clone())
                .reset_synced_until(&tenant, provider, to)
                .await?;
        }
        Command::Worker => {
            let indexer = Arc::new(HttpIndexer::from_config(&cfg.indexer)?);
            // Provider API clients are registered by the embedding deployment.
            let providers = ProviderRegistry::new();
            if providers.is_empty() {
                warn!("no provider clients registered; provider jobs will fail and dead-letter");
            }
            let runner = JobRunner::new(
                pool.clone(),
                cfg.clone(),
                tracker,
                job_queue,
                indexer,
                providers,
            );
            info!("starting queue worker");
            queue::run_worker(pool, &runner, WorkerSettings::from_config(&cfg)).await;
        }
        Command::ExampleConfig => {}
    }
    Ok(())
}

async fn read_units(path: &Path) -> Result<Vec<WorkUnit>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<WorkUnit>(line)
                .with_context(|| format!("{}:{}: invalid work unit", path.display(), i + 1))
        })
        .collect()
}

fn print_run(run: &BackfillRun) {
    let state = match run.completed_at {
        Some(at) => format!("completed {}", at.to_rfc3339()),
        None if run.pending_ingest_jobs() > 0 => {
            format!("{} ingest jobs pending", run.pending_ingest_jobs())
        }
        None => "waiting for indexing".to_string(),
    };
    println!(
        "{} {} ingest {}/{}/{} (done/attempted/total) index {}/{} - {}",
        run.backfill_id,
        run.provider,
        run.done_ingest_jobs,
        run.attempted_ingest_jobs,
        run.total_ingest_jobs,
        run.done_index_jobs,
        run.total_index_jobs,
        state
    );
}
