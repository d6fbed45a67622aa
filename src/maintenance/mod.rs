//! The maintenance engine: expiry scanning with cascading deletes, index
//! reconciliation, and subscriber matching for new posts.
//!
//! All state lives in the [`TreeStore`](crate::tree_store::TreeStore); every
//! operation here is idempotent and safe to run on overlapping schedules.

mod audit;
mod cascade;
mod error;
mod expiry;
mod reconciler;
mod scanner;
mod subscribers;

pub use audit::{audit_indices, IndexAudit};
pub use cascade::{
    applications_by_post, cascade_delete_post, delete_application, CascadeFailure,
    CascadeOutcome, CascadeStep,
};
pub use error::MaintenanceError;
pub use expiry::{
    ExpiryBasis, ExpiryPolicy, PostClass, DEFAULT_CREATION_MAX_AGE_DAYS,
    DEFAULT_SCHEDULED_GRACE_DAYS,
};
pub use reconciler::{
    ApplicationOutcome, IndexReconciler, ReconcileReport, RetryPolicy, DEFAULT_CONCURRENCY,
};
pub use scanner::{ExpiredPost, ExpiryScanner, ScanReport};
pub use subscribers::{
    GeoDistance, HaversineDistance, NewPostQuery, SubscriberMatcher, EARTH_RADIUS_METERS,
};
