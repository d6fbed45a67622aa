mod file_config;

pub use file_config::{BackgroundJobsConfig, ExpiryConfig, FileConfig, ReconcileConfig};

use crate::maintenance::{
    ExpiryPolicy, DEFAULT_CONCURRENCY, DEFAULT_CREATION_MAX_AGE_DAYS, DEFAULT_SCHEDULED_GRACE_DAYS,
};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_METRICS_PORT: u16 = 9092;
const DEFAULT_INTERVAL_HOURS: u64 = 24;
const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 90;

/// CLI arguments that take part in config resolution. TOML values win over
/// these where both are present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub scheduled_grace_days: Option<u32>,
    pub creation_max_age_days: Option<u32>,
    pub reconcile_concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    pub expiry: ExpirySettings,
    pub reconcile: ReconcileSettings,
    pub background_jobs: BackgroundJobsSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file
            .metrics_port
            .or(cli.metrics_port)
            .unwrap_or(DEFAULT_METRICS_PORT);

        let expiry_file = file.expiry.unwrap_or_default();
        let expiry = ExpirySettings {
            scheduled_grace_days: expiry_file
                .scheduled_grace_days
                .or(cli.scheduled_grace_days)
                .unwrap_or(DEFAULT_SCHEDULED_GRACE_DAYS),
            creation_max_age_days: expiry_file
                .creation_max_age_days
                .or(cli.creation_max_age_days)
                .unwrap_or(DEFAULT_CREATION_MAX_AGE_DAYS),
            interval_hours: expiry_file.interval_hours.unwrap_or(DEFAULT_INTERVAL_HOURS),
        };

        let reconcile_file = file.reconcile.unwrap_or_default();
        let reconcile = ReconcileSettings {
            interval_hours: reconcile_file
                .interval_hours
                .unwrap_or(DEFAULT_INTERVAL_HOURS),
            concurrency: reconcile_file
                .concurrency
                .or(cli.reconcile_concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            live: reconcile_file.live.unwrap_or(true),
        };

        if expiry.interval_hours == 0 || reconcile.interval_hours == 0 {
            bail!("interval_hours must be at least 1");
        }
        if reconcile.concurrency == 0 {
            bail!("reconcile concurrency must be at least 1");
        }

        let jobs_file = file.background_jobs.unwrap_or_default();
        let background_jobs = BackgroundJobsSettings {
            audit_retention_days: jobs_file
                .audit_retention_days
                .unwrap_or(DEFAULT_AUDIT_RETENTION_DAYS),
        };

        Ok(Self {
            db_dir,
            metrics_port,
            expiry,
            reconcile,
            background_jobs,
        })
    }

    /// The record tree.
    pub fn store_db_path(&self) -> PathBuf {
        self.db_dir.join("store.db")
    }

    /// Job history, schedules and audit log.
    pub fn server_db_path(&self) -> PathBuf {
        self.db_dir.join("server.db")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySettings {
    pub scheduled_grace_days: u32,
    pub creation_max_age_days: u32,
    pub interval_hours: u64,
}

impl ExpirySettings {
    pub fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::from_days(self.scheduled_grace_days, self.creation_max_age_days)
    }

    pub fn interval(&self) -> Duration {
        hours(self.interval_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub interval_hours: u64,
    pub concurrency: usize,
    pub live: bool,
}

impl ReconcileSettings {
    pub fn interval(&self) -> Duration {
        hours(self.interval_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJobsSettings {
    pub audit_retention_days: u32,
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 60 * 60)
}
