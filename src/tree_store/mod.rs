//! Hierarchical key-value store the maintenance engine works against.
//!
//! The tree is addressed by `/`-separated paths. Every backend offers point
//! reads, child listings, atomic multi-path updates and an insertion feed.

mod feed;
pub mod json_tree;
mod memory_store;
mod path;
mod schema;
mod sqlite_store;
mod update;

pub use feed::{
    created_nodes, ChildEvent, ChildFeed, NodeCreated, Relist, FEED_CHANNEL_CAPACITY,
};
pub use memory_store::MemoryTreeStore;
pub use path::{is_valid_key, TreePath};
pub use schema::TREE_VERSIONED_SCHEMAS;
pub use sqlite_store::SqliteTreeStore;
pub use update::MultiPathUpdate;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Invalid value at '{path}': {reason}")]
    InvalidValue { path: String, reason: &'static str },

    #[error("Update writes both '{ancestor}' and its descendant '{descendant}'")]
    ConflictingUpdate { ancestor: String, descendant: String },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub fn read(path: &TreePath, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Read {
            path: path.to_string(),
            source: source.into(),
        }
    }

    pub fn write(path: impl ToString, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Write {
            path: path.to_string(),
            source: source.into(),
        }
    }
}

/// A shared, mutable JSON tree.
///
/// Writes never store `null` or empty containers: they remove the node
/// instead, and a node whose last child is removed disappears as well.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Value stored at `path`, or `None` when nothing is there.
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError>;

    async fn exists(&self, path: &TreePath) -> Result<bool, StoreError> {
        Ok(self.get(path).await?.is_some())
    }

    /// Direct children of `path` ordered by key.
    async fn children(&self, path: &TreePath) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .get(path)
            .await?
            .map(|node| json_tree::children_of(&node))
            .unwrap_or_default())
    }

    /// Apply every entry of `update` or none of them.
    async fn update(&self, update: MultiPathUpdate) -> Result<(), StoreError>;

    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError> {
        let mut update = MultiPathUpdate::new();
        update.set(path.clone(), value);
        self.update(update).await
    }

    /// Remove the node at `path`. Removing a missing node is a no-op.
    async fn delete(&self, path: &TreePath) -> Result<(), StoreError> {
        let mut update = MultiPathUpdate::new();
        update.remove(path.clone());
        self.update(update).await
    }

    /// Store `value` under a freshly generated key below `parent`.
    async fn push(&self, parent: &TreePath, value: Value) -> Result<String, StoreError> {
        let key = generate_push_key();
        self.set(&parent.child(&key), value).await?;
        Ok(key)
    }

    /// Feed of the children of `parent`: the current ones first, then every
    /// child created from now on.
    async fn subscribe_child_added(&self, parent: &TreePath) -> Result<ChildFeed, StoreError>;
}

/// Store-assigned key: millisecond timestamp in hex followed by random bits,
/// so keys sort roughly by creation time.
pub fn generate_push_key() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{:012x}{}", millis, &random[..12])
}
