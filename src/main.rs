use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use boardkeeper::background_jobs::jobs::{ExpiryScanJob, IndexReconcileJob, JobAuditCleanupJob};
use boardkeeper::background_jobs::{create_scheduler, JobContext, JobRunInfo};
use boardkeeper::config::{self, AppConfig, FileConfig};
use boardkeeper::maintenance::{
    audit_indices, ExpiryScanner, IndexAudit, IndexReconciler, NewPostQuery, ReconcileReport,
    ScanReport, SubscriberMatcher,
};
use boardkeeper::metrics;
use boardkeeper::model::GeoPoint;
use boardkeeper::server_store::{JobAuditEntry, ServerStore, SqliteServerStore};
use boardkeeper::tree_store::{SqliteTreeStore, TreePath, TreeStore};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid RFC 3339 time '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[clap(name = "boardkeeper", version, about = "Maintenance daemon for the board's record tree")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding store.db (records) and server.db (job history).
    /// Can also be specified in config file.
    #[clap(long, global = true, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, global = true)]
    pub metrics_port: Option<u16>,

    /// Days a post survives its latest scheduled time.
    #[clap(long, global = true)]
    pub scheduled_grace_days: Option<u32>,

    /// Days a post without scheduled times survives its creation.
    #[clap(long, global = true)]
    pub creation_max_age_days: Option<u32>,

    /// Applications reconciled concurrently.
    #[clap(long, global = true)]
    pub concurrency: Option<usize>,

    /// Print reports as JSON instead of text.
    #[clap(long, global = true)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job scheduler, the live index reconciler and the metrics endpoint.
    Serve,
    /// Run one expiry scan and print the report.
    Scan {
        /// Evaluate expiry as of this RFC 3339 time instead of now.
        #[clap(long, value_parser = parse_instant)]
        at: Option<DateTime<Utc>>,
    },
    /// Run one full index reconciliation pass.
    Reconcile,
    /// List the push tokens a new post would notify.
    Subscribers {
        /// JSON request body of the form {"post": {...}, "userID": "..."}.
        #[clap(long, value_parser = parse_path, conflicts_with_all = ["latitude", "longitude"])]
        request: Option<PathBuf>,
        #[clap(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[clap(long, allow_hyphen_values = true)]
        longitude: Option<f64>,
        #[clap(long)]
        category: Option<String>,
        /// Author of the post; their own subscriptions are skipped.
        #[clap(long)]
        author: Option<String>,
    },
    /// Replace the whole record tree with a JSON export.
    Import {
        #[clap(value_parser = parse_path)]
        file: PathBuf,
    },
    /// Write the whole record tree as JSON.
    Export {
        /// Output file; stdout when omitted.
        #[clap(long, value_parser = parse_path)]
        output: Option<PathBuf>,
    },
    /// Check the application indices against the applications without changing anything.
    Audit,
    /// Show recent background job runs and audit entries.
    Jobs {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            scheduled_grace_days: args.scheduled_grace_days,
            creation_max_age_days: args.creation_max_age_days,
            reconcile_concurrency: args.concurrency,
        }
    }
}

const JOB_IDS: &[&str] = &["expiry_scan", "index_reconcile", "job_audit_cleanup"];

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&config::CliConfig::from(&cli_args), file_config)?;

    info!("Opening record store at {:?}...", app_config.store_db_path());
    let tree_store = Arc::new(SqliteTreeStore::new(app_config.store_db_path())?);

    match cli_args.command {
        Command::Serve => serve(&app_config, tree_store).await,
        Command::Scan { at } => {
            let scanner = ExpiryScanner::new(tree_store, app_config.expiry.policy());
            let report = scanner
                .run(at.unwrap_or_else(Utc::now), &CancellationToken::new())
                .await?;
            output(cli_args.json, &report, print_scan_report)
        }
        Command::Reconcile => {
            let reconciler = IndexReconciler::new(tree_store, app_config.reconcile.concurrency);
            let report = reconciler.run_pass(&CancellationToken::new()).await?;
            output(cli_args.json, &report, print_reconcile_report)
        }
        Command::Subscribers {
            request,
            latitude,
            longitude,
            category,
            author,
        } => {
            let query = match request {
                Some(path) => {
                    let body = read_json(&path)?;
                    NewPostQuery::from_request(&body)
                        .context("Request has no post with a valid location")?
                }
                None => {
                    let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
                        bail!("Either --request or both --latitude and --longitude are required");
                    };
                    NewPostQuery {
                        location: GeoPoint::new(latitude, longitude)
                            .context("Latitude or longitude out of range")?,
                        category,
                        author_id: author,
                    }
                }
            };
            let tokens = SubscriberMatcher::new(tree_store).push_tokens(&query).await?;
            output(cli_args.json, &tokens, |tokens| {
                for token in tokens {
                    println!("{}", token);
                }
            })
        }
        Command::Import { file } => {
            let data = read_json(&file)?;
            tree_store.set(&TreePath::root(), data).await?;
            info!("Imported {:?} into {:?}", file, app_config.store_db_path());
            Ok(())
        }
        Command::Export { output } => {
            let data = tree_store
                .get(&TreePath::root())
                .await?
                .unwrap_or_else(|| serde_json::json!({}));
            let text = serde_json::to_string_pretty(&data)?;
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("Failed to write export to {:?}", path))?,
                None => println!("{}", text),
            }
            Ok(())
        }
        Command::Audit => {
            let audit = audit_indices(tree_store.as_ref()).await?;
            output(cli_args.json, &audit, print_audit)?;
            if !audit.is_consistent() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Jobs { limit } => {
            let server_store = SqliteServerStore::new(app_config.server_db_path())?;
            print_jobs(&server_store, limit, cli_args.json)
        }
    }
}

async fn serve(app_config: &AppConfig, tree_store: Arc<SqliteTreeStore>) -> Result<()> {
    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening server database at {:?}...", app_config.server_db_path());
    let server_store: Arc<dyn ServerStore> =
        Arc::new(SqliteServerStore::new(app_config.server_db_path())?);

    let shutdown_token = CancellationToken::new();
    let (hook_sender, hook_receiver) = mpsc::channel(100);
    let job_context = JobContext::new(
        shutdown_token.child_token(),
        tree_store.clone(),
        server_store.clone(),
    )
    .with_hook_sender(hook_sender);

    let (mut scheduler, scheduler_handle) = create_scheduler(
        server_store.clone(),
        hook_receiver,
        shutdown_token.clone(),
        job_context,
    );

    scheduler
        .register_job(Arc::new(ExpiryScanJob::new(
            app_config.expiry.policy(),
            app_config.expiry.interval(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(IndexReconcileJob::new(
            app_config.reconcile.concurrency,
            app_config.reconcile.interval(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(JobAuditCleanupJob::new(
            app_config.background_jobs.audit_retention_days,
        )))
        .await;

    for job in scheduler_handle.list_jobs().await? {
        info!(
            "Job {} ({}): next run {}",
            job.id,
            job.schedule.schedule_type,
            job.next_run_at.as_deref().unwrap_or("on hook")
        );
    }

    let live_task = if app_config.reconcile.live {
        let reconciler = Arc::new(IndexReconciler::new(
            tree_store.clone(),
            app_config.reconcile.concurrency,
        ));
        Some(tokio::spawn(reconciler.run_live(shutdown_token.child_token())))
    } else {
        info!("Live index reconciliation disabled");
        None
    };

    let mut metrics_task = tokio::spawn(metrics::run_metrics_server(
        app_config.metrics_port,
        shutdown_token.child_token(),
    ));
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let metrics_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating graceful shutdown");
            false
        }
        result = &mut metrics_task => {
            match result {
                Ok(Ok(())) => warn!("Metrics server stopped"),
                Ok(Err(e)) => error!("Metrics server failed: {:#}", e),
                Err(e) => error!("Metrics server task panicked: {}", e),
            }
            true
        }
    };
    shutdown_token.cancel();

    if let Err(e) = scheduler_task.await {
        error!("Scheduler task panicked: {}", e);
    }
    if let Some(live_task) = live_task {
        match live_task.await {
            Ok(Ok(report)) => info!(
                "Live reconciliation handled {} applications",
                report.processed
            ),
            Ok(Err(e)) => error!("Live reconciliation failed: {}", e),
            Err(e) => error!("Live reconciliation task panicked: {}", e),
        }
    }
    if !metrics_finished {
        let _ = metrics_task.await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON in {:?}", path))
}

fn output<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_scan_report(report: &ScanReport) {
    println!(
        "Scanned {} posts: {} live, {} expired, {} unclassifiable",
        report.scanned,
        report.live,
        report.expired.len(),
        report.unclassifiable.len()
    );
    println!(
        "Deleted {} posts and {} applications",
        report.posts_deleted(),
        report.applications_deleted()
    );
    for failure in &report.failures {
        println!(
            "  failed {:?} for post {} (application {}): {}",
            failure.step,
            failure.post_id,
            failure.application_id.as_deref().unwrap_or("-"),
            failure.error
        );
    }
}

fn print_reconcile_report(report: &ReconcileReport) {
    println!(
        "Cleared indices of {} posts and {} users",
        report.cleared_posts, report.cleared_users
    );
    println!(
        "Processed {} applications: {} indexed, {} incomplete deleted, {} orphans deleted, {} superseded, {} failed",
        report.processed,
        report.indexed,
        report.deleted_incomplete,
        report.deleted_orphaned,
        report.superseded,
        report.failed
    );
}

fn print_audit(audit: &IndexAudit) {
    if audit.is_consistent() {
        println!("Indices are consistent");
        return;
    }
    let sections = [
        ("Missing index entries", &audit.missing_entries),
        ("Stale index entries", &audit.stale_entries),
        ("Incomplete applications", &audit.incomplete_applications),
        ("Orphaned applications", &audit.orphaned_applications),
    ];
    for (title, items) in sections {
        if items.is_empty() {
            continue;
        }
        println!("{} ({}):", title, items.len());
        for item in items {
            println!("  {}", item);
        }
    }
}

#[derive(Serialize)]
struct JobHistory {
    job_id: String,
    next_run_at: Option<String>,
    runs: Vec<JobRunInfo>,
    audit: Vec<JobAuditEntry>,
}

fn print_jobs(server_store: &dyn ServerStore, limit: usize, json: bool) -> Result<()> {
    let states = server_store.get_all_schedule_states()?;
    let history = JOB_IDS
        .iter()
        .map(|job_id| -> Result<JobHistory> {
            Ok(JobHistory {
                job_id: job_id.to_string(),
                next_run_at: states
                    .iter()
                    .find(|s| s.job_id == *job_id)
                    .map(|s| s.next_run_at.to_rfc3339()),
                runs: server_store
                    .get_job_history(job_id, limit)?
                    .into_iter()
                    .map(JobRunInfo::from)
                    .collect(),
                audit: server_store.get_job_audit_log_by_job(job_id, limit, 0)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    output(json, &history, |history| {
        for job in history {
            println!(
                "{} (next run: {})",
                job.job_id,
                job.next_run_at.as_deref().unwrap_or("not scheduled")
            );
            for run in &job.runs {
                println!(
                    "  {} {} [{}]{}",
                    run.started_at,
                    run.status,
                    run.triggered_by,
                    run.error_message
                        .as_deref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
            }
            for entry in &job.audit {
                let at = DateTime::<Utc>::from_timestamp(entry.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| entry.timestamp.to_string());
                println!(
                    "  audit {} {}{}",
                    at,
                    entry.event_type.as_str(),
                    entry
                        .error
                        .as_deref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
            }
        }
    })
}
