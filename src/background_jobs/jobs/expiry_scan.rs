//! Periodic expiry scan with cascading deletes.

use crate::background_jobs::{
    audit_logger::JobAuditLogger,
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::maintenance::{ExpiryPolicy, ExpiryScanner, ScanReport};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub struct ExpiryScanJob {
    policy: ExpiryPolicy,
    interval: Duration,
}

impl ExpiryScanJob {
    pub fn new(policy: ExpiryPolicy, interval: Duration) -> Self {
        Self { policy, interval }
    }
}

fn summary(report: &ScanReport) -> serde_json::Value {
    json!({
        "scanned": report.scanned,
        "live": report.live,
        "expired": report.expired.len(),
        "unclassifiable": report.unclassifiable.len(),
        "posts_deleted": report.posts_deleted(),
        "applications_deleted": report.applications_deleted(),
        "failures": report.failures.len(),
    })
}

#[async_trait]
impl BackgroundJob for ExpiryScanJob {
    fn id(&self) -> &'static str {
        "expiry_scan"
    }

    fn name(&self) -> &'static str {
        "Expiry Scan"
    }

    fn description(&self) -> &'static str {
        "Delete expired posts together with their applications"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnStartup],
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let audit = JobAuditLogger::new(ctx.server_store.clone(), self.id());
        audit.log_started(Some(json!({
            "scheduled_grace_secs": self.policy.scheduled_grace.num_seconds(),
            "creation_max_age_secs": self.policy.creation_max_age.num_seconds(),
        })));

        let scanner = ExpiryScanner::new(ctx.tree_store.clone(), self.policy);
        let report = match scanner.run(Utc::now(), &ctx.cancellation_token).await {
            Ok(report) => report,
            Err(e) => {
                audit.log_failed(&e.to_string(), None);
                return Err(e.into());
            }
        };

        let details = summary(&report);
        if report.failures.is_empty() {
            audit.log_completed(Some(details));
        } else {
            audit.log_failed(
                &format!("{} cascade steps failed", report.failures.len()),
                Some(details),
            );
        }

        if report.posts_deleted() > 0 && ctx.emit_hook(HookEvent::OnPostsExpired) {
            info!(
                "Expiry scan deleted {} posts, requested index reconciliation",
                report.posts_deleted()
            );
        }

        Ok(())
    }
}
