//! Retention for the job audit log.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Deletes job audit entries older than the retention period, once a day.
pub struct JobAuditCleanupJob {
    retention_days: u32,
}

impl JobAuditCleanupJob {
    pub fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - i64::from(self.retention_days) * DAY_SECS
    }
}

#[async_trait]
impl BackgroundJob for JobAuditCleanupJob {
    fn id(&self) -> &'static str {
        "job_audit_cleanup"
    }

    fn name(&self) -> &'static str {
        "Job Audit Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete old job audit log entries based on retention policy"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(DAY_SECS as u64))
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = self.cutoff(Utc::now().timestamp());
        let deleted = ctx
            .server_store
            .cleanup_old_job_audit_entries(cutoff)
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!(
                "Deleted {} job audit entries older than {} days",
                deleted, self.retention_days
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_cutoff() {
        let job = JobAuditCleanupJob::new(90);
        assert_eq!(job.cutoff(1_700_000_000), 1_700_000_000 - 7_776_000);
        assert_eq!(JobAuditCleanupJob::new(0).cutoff(5), 5);
    }
}
