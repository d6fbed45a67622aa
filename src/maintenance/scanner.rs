//! Expiry scan: classify every post and cascade-delete the expired ones.

use super::cascade::{applications_by_post, cascade_delete_post, CascadeFailure};
use super::expiry::{ExpiryBasis, ExpiryPolicy, PostClass};
use super::MaintenanceError;
use crate::metrics;
use crate::model::{paths, Post};
use crate::tree_store::TreeStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiredPost {
    pub post_id: String,
    pub basis: ExpiryBasis,
    pub applications_deleted: usize,
    pub post_deleted: bool,
}

/// Result of one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub live: usize,
    pub expired: Vec<ExpiredPost>,
    /// Posts with neither scheduled times nor a creation time.
    pub unclassifiable: Vec<String>,
    pub failures: Vec<CascadeFailure>,
}

impl ScanReport {
    pub fn posts_deleted(&self) -> usize {
        self.expired.iter().filter(|p| p.post_deleted).count()
    }

    pub fn applications_deleted(&self) -> usize {
        self.expired.iter().map(|p| p.applications_deleted).sum()
    }
}

pub struct ExpiryScanner {
    store: Arc<dyn TreeStore>,
    policy: ExpiryPolicy,
}

impl ExpiryScanner {
    pub fn new(store: Arc<dyn TreeStore>, policy: ExpiryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ExpiryPolicy {
        &self.policy
    }

    /// Run one pass over a snapshot of the posts, as of `now`.
    ///
    /// Failing to read the snapshot aborts the pass. Failures while deleting
    /// one post are recorded in the report and the pass moves on.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, MaintenanceError> {
        let posts = self
            .store
            .children(&paths::posts())
            .await
            .map_err(|e| {
                error!("Expiry scan aborted, could not read posts: {}", e);
                MaintenanceError::ReadFailure(e)
            })?;
        // Applications are read up front so the cascade can find children the
        // post index has lost track of.
        let applications = self
            .store
            .children(&paths::applications())
            .await
            .map_err(|e| {
                error!("Expiry scan aborted, could not read applications: {}", e);
                MaintenanceError::ReadFailure(e)
            })?;
        let by_post = applications_by_post(&applications);

        let mut report = ScanReport::default();
        for (post_id, node) in posts {
            if cancel.is_cancelled() {
                info!(
                    "Expiry scan cancelled after {} posts ({} deleted)",
                    report.scanned,
                    report.posts_deleted()
                );
                return Err(MaintenanceError::Cancelled);
            }
            if !Post::node_is_canonical(&node) {
                debug!("Skipping post {} which only holds index entries", post_id);
                continue;
            }

            report.scanned += 1;
            let post = Post::from_node(&post_id, &node);
            let class = self.policy.classify(&post, now);
            metrics::record_post_scanned(class.label());

            match class {
                PostClass::Live(_) => report.live += 1,
                PostClass::Unclassifiable => {
                    warn!(
                        "Post {} has neither scheduled dates nor a creation time, leaving it in place",
                        post_id
                    );
                    report.unclassifiable.push(post_id);
                }
                PostClass::Expired(basis) => {
                    let mut candidates: BTreeSet<String> = post.applications.clone();
                    if let Some(canonical) = by_post.get(&post_id) {
                        candidates.extend(canonical.iter().cloned());
                    }
                    debug!(
                        "Post {} expired ({:?}), {} candidate applications",
                        post_id,
                        basis,
                        candidates.len()
                    );

                    let outcome = cascade_delete_post(self.store.as_ref(), &post_id, &candidates).await;
                    report.expired.push(ExpiredPost {
                        post_id,
                        basis,
                        applications_deleted: outcome.applications_deleted.len(),
                        post_deleted: outcome.post_deleted,
                    });
                    report.failures.extend(outcome.failures);
                }
            }
        }

        info!(
            "Expiry scan finished: {} posts scanned, {} live, {} expired ({} deleted, {} applications), {} unclassifiable, {} failures",
            report.scanned,
            report.live,
            report.expired.len(),
            report.posts_deleted(),
            report.applications_deleted(),
            report.unclassifiable.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
