//! Full rebuild of the application indices.

use crate::background_jobs::{
    audit_logger::JobAuditLogger,
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::maintenance::IndexReconciler;
use async_trait::async_trait;
use std::time::Duration;

pub struct IndexReconcileJob {
    concurrency: usize,
    interval: Duration,
}

impl IndexReconcileJob {
    pub fn new(concurrency: usize, interval: Duration) -> Self {
        Self {
            concurrency,
            interval,
        }
    }
}

#[async_trait]
impl BackgroundJob for IndexReconcileJob {
    fn id(&self) -> &'static str {
        "index_reconcile"
    }

    fn name(&self) -> &'static str {
        "Index Reconcile"
    }

    fn description(&self) -> &'static str {
        "Rebuild post and user application indices from the applications"
    }

    fn schedule(&self) -> JobSchedule {
        // Expired posts can leave orphaned applications behind when a
        // cascade step failed.
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnStartup, HookEvent::OnPostsExpired],
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let audit = JobAuditLogger::new(ctx.server_store.clone(), self.id());
        audit.log_started(None);

        let reconciler = IndexReconciler::new(ctx.tree_store.clone(), self.concurrency);
        match reconciler.run_pass(&ctx.cancellation_token).await {
            Ok(report) => {
                let details = serde_json::to_value(&report).ok();
                if report.failed > 0 {
                    audit.log_failed(
                        &format!("{} applications could not be reconciled", report.failed),
                        details,
                    );
                } else {
                    audit.log_completed(details);
                }
                Ok(())
            }
            Err(e) => {
                audit.log_failed(&e.to_string(), None);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::audit_indices;
    use crate::server_store::{JobAuditEventType, ServerStore, SqliteServerStore};
    use crate::tree_store::MemoryTreeStore;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_pass_rebuilds_indices() {
        let tree = Arc::new(MemoryTreeStore::with_data(json!({
            "posts": {"p1": {"creationTime": 1000, "applications": {"stale": true}}},
            "applications": {
                "a1": {"post": "p1", "applicant": "u1"},
                "a2": {"post": "gone", "applicant": "u1"}
            }
        })).unwrap());
        let server = Arc::new(SqliteServerStore::in_memory().unwrap());
        let ctx = JobContext::new(CancellationToken::new(), tree.clone(), server.clone());

        IndexReconcileJob::new(4, Duration::from_secs(3600))
            .execute(&ctx)
            .await
            .unwrap();

        assert!(audit_indices(tree.as_ref()).await.unwrap().is_consistent());
        let entries = server.get_job_audit_log_by_job("index_reconcile", 10, 0).unwrap();
        let completed = entries
            .iter()
            .find(|e| e.event_type == JobAuditEventType::Completed)
            .unwrap();
        let details = completed.details.as_ref().unwrap();
        assert_eq!(details["indexed"], 1);
        assert_eq!(details["deleted_orphaned"], 1);
    }

    #[test]
    fn test_listens_for_expired_posts() {
        let job = IndexReconcileJob::new(4, Duration::from_secs(60));
        assert!(job.schedule().listens_to(HookEvent::OnPostsExpired));
        assert!(job.schedule().listens_to(HookEvent::OnStartup));
    }
}
