//! Deleting a post together with the applications that point at it.

use crate::metrics;
use crate::model::{paths, Application};
use crate::tree_store::{MultiPathUpdate, StoreError, TreeStore};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStep {
    ApplicationRead,
    ApplicationDelete,
    PostDelete,
}

/// One piece of a cascading delete that did not go through. The reconciler
/// removes whatever it leaves behind on its next pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeFailure {
    pub post_id: String,
    pub application_id: Option<String>,
    pub step: CascadeStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeOutcome {
    pub applications_deleted: Vec<String>,
    pub post_deleted: bool,
    pub failures: Vec<CascadeFailure>,
}

/// Remove an application and both of its index mirrors in one update.
///
/// Deleting an application that is already gone is a no-op.
pub async fn delete_application(
    store: &dyn TreeStore,
    application: &Application,
) -> Result<(), StoreError> {
    let mut update = MultiPathUpdate::new();
    update.remove(paths::application(&application.id));
    if let Some(applicant) = &application.applicant {
        update.remove(paths::user_application_entry(applicant, &application.id));
    }
    if let Some(post) = &application.post {
        update.remove(paths::post_application_entry(post, &application.id));
    }
    store.update(update).await
}

/// Application ids grouped by the post they reference, read from the
/// canonical application records.
pub fn applications_by_post(applications: &[(String, Value)]) -> HashMap<String, BTreeSet<String>> {
    let mut by_post: HashMap<String, BTreeSet<String>> = HashMap::new();
    for (id, node) in applications {
        if let Some(post) = Application::from_node(id, node).post {
            by_post.entry(post).or_default().insert(id.clone());
        }
    }
    by_post
}

/// Delete every application of `post_id` among `candidates`, then the post.
///
/// Each candidate is re-read first and only deleted while it still points at
/// this post, so a stale index cannot take down someone else's application.
/// Failures are collected, never propagated: the post is deleted last even
/// when an application could not be, leaving an orphan for the reconciler.
pub async fn cascade_delete_post(
    store: &dyn TreeStore,
    post_id: &str,
    candidates: &BTreeSet<String>,
) -> CascadeOutcome {
    let mut outcome = CascadeOutcome::default();

    for application_id in candidates {
        let node = match store.get(&paths::application(application_id)).await {
            Ok(Some(node)) => node,
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    "Failed to read application {} of post {}: {}",
                    application_id, post_id, e
                );
                outcome.failures.push(CascadeFailure {
                    post_id: post_id.to_string(),
                    application_id: Some(application_id.clone()),
                    step: CascadeStep::ApplicationRead,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let application = Application::from_node(application_id, &node);
        if application.post.as_deref() != Some(post_id) {
            debug!(
                "Application {} no longer references post {}, leaving it alone",
                application_id, post_id
            );
            continue;
        }

        match delete_application(store, &application).await {
            Ok(()) => outcome.applications_deleted.push(application_id.clone()),
            Err(e) => {
                warn!(
                    "Failed to delete application {} of post {}: {}",
                    application_id, post_id, e
                );
                outcome.failures.push(CascadeFailure {
                    post_id: post_id.to_string(),
                    application_id: Some(application_id.clone()),
                    step: CascadeStep::ApplicationDelete,
                    error: e.to_string(),
                });
            }
        }
    }

    match store.delete(&paths::post(post_id)).await {
        Ok(()) => outcome.post_deleted = true,
        Err(e) => {
            warn!("Failed to delete post {}: {}", post_id, e);
            outcome.failures.push(CascadeFailure {
                post_id: post_id.to_string(),
                application_id: None,
                step: CascadeStep::PostDelete,
                error: e.to_string(),
            });
        }
    }

    metrics::record_records_deleted("application", outcome.applications_deleted.len());
    if outcome.post_deleted {
        metrics::record_records_deleted("post", 1);
    }
    for _ in &outcome.failures {
        metrics::record_cascade_failure();
    }

    outcome
}
