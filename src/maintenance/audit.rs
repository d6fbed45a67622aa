//! Read-only consistency check of the application indices.

use super::MaintenanceError;
use crate::model::{paths, Application, Post};
use crate::tree_store::{TreePath, TreeStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Differences between the indices and what the applications imply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexAudit {
    /// Index entries that should exist but do not.
    pub missing_entries: Vec<String>,
    /// Index entries with no application backing them.
    pub stale_entries: Vec<String>,
    /// Applications without a post or applicant reference.
    pub incomplete_applications: Vec<String>,
    /// Applications whose post does not exist.
    pub orphaned_applications: Vec<String>,
}

impl IndexAudit {
    pub fn is_consistent(&self) -> bool {
        self.missing_entries.is_empty()
            && self.stale_entries.is_empty()
            && self.incomplete_applications.is_empty()
            && self.orphaned_applications.is_empty()
    }
}

async fn index_entries(
    store: &dyn TreeStore,
    collection: &TreePath,
) -> Result<(BTreeSet<TreePath>, HashSet<String>), MaintenanceError> {
    let records = store
        .children(collection)
        .await
        .map_err(MaintenanceError::ReadFailure)?;

    let mut entries = BTreeSet::new();
    let mut canonical = HashSet::new();
    for (key, node) in records {
        if Post::node_is_canonical(&node) {
            canonical.insert(key.clone());
        }
        let Some(index) = node.get(paths::APPLICATIONS_INDEX) else {
            continue;
        };
        let index_path = collection.child(&key).child(paths::APPLICATIONS_INDEX);
        for (application_id, _) in crate::tree_store::json_tree::children_of(index) {
            entries.insert(index_path.child(&application_id));
        }
    }
    Ok((entries, canonical))
}

/// Compare the current indices against the canonical applications without
/// changing anything.
pub async fn audit_indices(store: &dyn TreeStore) -> Result<IndexAudit, MaintenanceError> {
    let applications = store
        .children(&paths::applications())
        .await
        .map_err(MaintenanceError::ReadFailure)?;
    let (post_entries, live_posts) = index_entries(store, &paths::posts()).await?;
    let (user_entries, _) = index_entries(store, &paths::users()).await?;

    let mut audit = IndexAudit::default();
    let mut expected = BTreeSet::new();
    for (id, node) in &applications {
        let application = Application::from_node(id, node);
        let Some((post, applicant)) = application.references() else {
            audit.incomplete_applications.push(id.clone());
            continue;
        };
        if !live_posts.contains(post) {
            audit.orphaned_applications.push(id.clone());
            continue;
        }
        expected.insert(paths::post_application_entry(post, id));
        expected.insert(paths::user_application_entry(applicant, id));
    }

    let actual: BTreeSet<TreePath> = post_entries.into_iter().chain(user_entries).collect();
    audit.missing_entries = expected.difference(&actual).map(ToString::to_string).collect();
    audit.stale_entries = actual.difference(&expected).map(ToString::to_string).collect();
    Ok(audit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_store::MemoryTreeStore;
    use serde_json::json;

    #[tokio::test]
    async fn reports_every_kind_of_drift() {
        let store = MemoryTreeStore::with_data(json!({
            "posts": {
                "p1": {"category": "x", "applications": {"a1": true, "zombie": true}}
            },
            "users": {"u1": {"pushToken": "t"}},
            "applications": {
                "a1": {"post": "p1", "applicant": "u1"},
                "a2": {"applicant": "u1"},
                "a3": {"post": "gone", "applicant": "u1"}
            }
        })).unwrap();

        let audit = audit_indices(&store).await.unwrap();
        assert_eq!(audit.missing_entries, vec!["users/u1/applications/a1"]);
        assert_eq!(audit.stale_entries, vec!["posts/p1/applications/zombie"]);
        assert_eq!(audit.incomplete_applications, vec!["a2"]);
        assert_eq!(audit.orphaned_applications, vec!["a3"]);
        assert!(!audit.is_consistent());
    }

    #[tokio::test]
    async fn empty_store_is_consistent() {
        let audit = audit_indices(&MemoryTreeStore::new()).await.unwrap();
        assert!(audit.is_consistent());
    }
}
