//! The maintenance duties as schedulable jobs.

mod audit_log_cleanup;
mod expiry_scan;
mod index_reconcile;

pub use audit_log_cleanup::JobAuditCleanupJob;
pub use expiry_scan::ExpiryScanJob;
pub use index_reconcile::IndexReconcileJob;

use super::job::JobError;
use crate::maintenance::MaintenanceError;

impl From<MaintenanceError> for JobError {
    fn from(e: MaintenanceError) -> Self {
        match e {
            MaintenanceError::Cancelled => JobError::Cancelled,
            other => JobError::ExecutionFailed(other.to_string()),
        }
    }
}
