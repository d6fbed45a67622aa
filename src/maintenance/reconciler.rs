//! Keeps the post and user application indices in line with the canonical
//! application records.
//!
//! The per-application step is shared by the one-shot pass and the live
//! subscription, so both converge to the same index.

use super::cascade::delete_application;
use super::MaintenanceError;
use crate::metrics;
use crate::model::{paths, Application, Post};
use crate::tree_store::{MultiPathUpdate, StoreError, TreePath, TreeStore};
use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 16;

/// What happened to one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationOutcome {
    /// Both index entries are in place.
    Indexed,
    /// Deleted because it lacks its post or applicant reference.
    DeletedIncomplete,
    /// Deleted because the post it references does not exist.
    DeletedOrphan,
    /// Removed or rewritten by someone else while it was being indexed.
    Superseded,
    /// A store call kept failing. Left for the next pass.
    Failed,
}

impl ApplicationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationOutcome::Indexed => "indexed",
            ApplicationOutcome::DeletedIncomplete => "deleted_incomplete",
            ApplicationOutcome::DeletedOrphan => "deleted_orphan",
            ApplicationOutcome::Superseded => "superseded",
            ApplicationOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Posts whose application index was cleared on start.
    pub cleared_posts: usize,
    /// Users whose application index was cleared on start.
    pub cleared_users: usize,
    pub processed: usize,
    pub indexed: usize,
    pub deleted_incomplete: usize,
    pub deleted_orphaned: usize,
    pub superseded: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn record(&mut self, outcome: ApplicationOutcome) {
        self.processed += 1;
        match outcome {
            ApplicationOutcome::Indexed => self.indexed += 1,
            ApplicationOutcome::DeletedIncomplete => self.deleted_incomplete += 1,
            ApplicationOutcome::DeletedOrphan => self.deleted_orphaned += 1,
            ApplicationOutcome::Superseded => self.superseded += 1,
            ApplicationOutcome::Failed => self.failed += 1,
        }
    }
}

/// Retries for single store calls made while reconciling one application.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

pub struct IndexReconciler {
    store: Arc<dyn TreeStore>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl IndexReconciler {
    pub fn new(store: Arc<dyn TreeStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remove the application index of every post and every user, one
    /// atomic update per collection. Returns the number of posts and users
    /// that had an index.
    pub async fn clear_indices(&self) -> Result<(usize, usize), MaintenanceError> {
        let posts = self.clear_collection_indices(&paths::posts()).await?;
        let users = self.clear_collection_indices(&paths::users()).await?;
        info!(
            "Cleared application indices of {} posts and {} users",
            posts, users
        );
        Ok((posts, users))
    }

    async fn clear_collection_indices(&self, collection: &TreePath) -> Result<usize, MaintenanceError> {
        let records = self
            .store
            .children(collection)
            .await
            .map_err(MaintenanceError::ReadFailure)?;

        let mut update = MultiPathUpdate::new();
        for (key, node) in &records {
            if node.get(paths::APPLICATIONS_INDEX).is_some() {
                update.remove(collection.child(key).child(paths::APPLICATIONS_INDEX));
            }
        }
        let cleared = update.len();
        if !update.is_empty() {
            self.store
                .update(update)
                .await
                .map_err(MaintenanceError::WriteFailure)?;
        }
        Ok(cleared)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts => {
                    debug!("{} failed (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a real post (not just a leftover index node) exists.
    async fn post_exists(&self, post_id: &str) -> Result<bool, StoreError> {
        let post_path = paths::post(post_id);
        let node = self
            .with_retry("Reading post", || self.store.get(&post_path))
            .await?;
        Ok(node.as_ref().is_some_and(Post::node_is_canonical))
    }

    async fn delete(&self, application: &Application, outcome: ApplicationOutcome) -> ApplicationOutcome {
        match self
            .with_retry("Deleting application", || {
                delete_application(self.store.as_ref(), application)
            })
            .await
        {
            Ok(()) => {
                metrics::record_records_deleted("application", 1);
                outcome
            }
            Err(e) => {
                warn!("Failed to delete application {}: {}", application.id, e);
                ApplicationOutcome::Failed
            }
        }
    }

    /// Bring one application and its two index entries into agreement.
    ///
    /// Never fails: store errors are retried, logged and reported as
    /// [`ApplicationOutcome::Failed`].
    pub async fn reconcile_application(&self, key: &str, node: &Value) -> ApplicationOutcome {
        let outcome = self.reconcile_inner(key, node).await;
        metrics::record_reconciled_application(outcome.label());
        outcome
    }

    async fn reconcile_inner(&self, key: &str, node: &Value) -> ApplicationOutcome {
        let application = Application::from_node(key, node);

        let Some(post_id) = application.post.clone() else {
            debug!("Application {} has no post, deleting it", key);
            return self
                .delete(&application, ApplicationOutcome::DeletedIncomplete)
                .await;
        };

        match self.post_exists(&post_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Application {} references missing post {}, deleting it", key, post_id);
                return self.delete(&application, ApplicationOutcome::DeletedOrphan).await;
            }
            Err(e) => {
                warn!("Could not check post {} of application {}: {}", post_id, key, e);
                return ApplicationOutcome::Failed;
            }
        }

        let Some(applicant) = application.applicant.clone() else {
            debug!("Application {} has no applicant, deleting it", key);
            return self
                .delete(&application, ApplicationOutcome::DeletedIncomplete)
                .await;
        };

        let post_entry = paths::post_application_entry(&post_id, key);
        let user_entry = paths::user_application_entry(&applicant, key);
        let mut update = MultiPathUpdate::new();
        update.set(user_entry.clone(), Value::Bool(true));
        update.set(post_entry.clone(), Value::Bool(true));
        if let Err(e) = self
            .with_retry("Writing index entries", || self.store.update(update.clone()))
            .await
        {
            warn!("Failed to index application {}: {}", key, e);
            return ApplicationOutcome::Failed;
        }
        metrics::record_index_entries_written(2);

        // The post or the application may have been deleted between the
        // check and the write. Undo what the write left behind.
        match self.post_exists(&post_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Post {} vanished while indexing application {}", post_id, key);
                return self.delete(&application, ApplicationOutcome::DeletedOrphan).await;
            }
            Err(e) => {
                warn!("Could not re-check post {} of application {}: {}", post_id, key, e);
                return ApplicationOutcome::Failed;
            }
        }

        let app_path = paths::application(key);
        let current = match self
            .with_retry("Re-reading application", || self.store.get(&app_path))
            .await
        {
            Ok(current) => current.map(|node| Application::from_node(key, &node)),
            Err(e) => {
                warn!("Could not re-read application {}: {}", key, e);
                return ApplicationOutcome::Failed;
            }
        };
        let unchanged = current
            .as_ref()
            .and_then(Application::references)
            .is_some_and(|refs| refs == (post_id.as_str(), applicant.as_str()));
        if unchanged {
            return ApplicationOutcome::Indexed;
        }

        debug!("Application {} changed while being indexed, removing its entries", key);
        let mut undo = MultiPathUpdate::new();
        undo.remove(user_entry);
        undo.remove(post_entry);
        match self
            .with_retry("Removing index entries", || self.store.update(undo.clone()))
            .await
        {
            Ok(()) => ApplicationOutcome::Superseded,
            Err(e) => {
                warn!("Failed to remove index entries of application {}: {}", key, e);
                ApplicationOutcome::Failed
            }
        }
    }

    /// One full pass: clear the indices, then rebuild them from a snapshot
    /// of the applications. Items are processed concurrently.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<ReconcileReport, MaintenanceError> {
        let mut report = ReconcileReport::default();
        (report.cleared_posts, report.cleared_users) = self.clear_indices().await?;

        let applications = self
            .store
            .children(&paths::applications())
            .await
            .map_err(MaintenanceError::ReadFailure)?;
        let total = applications.len();

        let outcomes: Vec<ApplicationOutcome> = stream::iter(applications)
            .map(|(key, node)| async move { self.reconcile_application(&key, &node).await })
            .buffer_unordered(self.concurrency)
            .take_until(cancel.cancelled())
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        if report.processed < total {
            info!(
                "Index reconciliation cancelled after {} of {} applications",
                report.processed, total
            );
            return Err(MaintenanceError::Cancelled);
        }

        info!(
            "Index reconciliation finished: {} applications, {} indexed, {} incomplete deleted, {} orphans deleted, {} superseded, {} failed",
            report.processed,
            report.indexed,
            report.deleted_incomplete,
            report.deleted_orphaned,
            report.superseded,
            report.failed
        );
        Ok(report)
    }

    /// Clear the indices, then follow the application feed until `cancel`
    /// fires, reconciling every existing and every newly inserted
    /// application. In-flight items finish before this returns.
    pub async fn run_live(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<ReconcileReport, MaintenanceError> {
        let mut report = ReconcileReport::default();
        (report.cleared_posts, report.cleared_users) = self.clear_indices().await?;

        let mut feed = self
            .store
            .subscribe_child_added(&paths::applications())
            .await
            .map_err(MaintenanceError::ReadFailure)?;
        info!("Live index reconciliation subscribed to {}", feed.parent());

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<ApplicationOutcome> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    report.record(joined.unwrap_or(ApplicationOutcome::Failed));
                }
                event = feed.next() => {
                    let Some(event) = event else {
                        warn!("Application feed closed, stopping live reconciliation");
                        break;
                    };
                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    };
                    let reconciler = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        reconciler
                            .reconcile_application(&event.key, &event.value)
                            .await
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            report.record(joined.unwrap_or(ApplicationOutcome::Failed));
        }
        info!(
            "Live index reconciliation stopped after {} applications",
            report.processed
        );
        Ok(report)
    }
}
