use crate::tree_store::StoreError;
use thiserror::Error;

/// Failures that abort a whole maintenance pass.
///
/// Per-record problems never show up here: they are contained and reported
/// in the pass report instead.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Store read failed: {0}")]
    ReadFailure(#[source] StoreError),

    #[error("Store write failed: {0}")]
    WriteFailure(#[source] StoreError),

    #[error("Maintenance pass was cancelled")]
    Cancelled,
}
