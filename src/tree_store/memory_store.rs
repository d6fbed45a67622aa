use super::json_tree::{children_of, find_invalid_key, get_at, normalize, set_at};
use super::{
    created_nodes, ChildFeed, MultiPathUpdate, NodeCreated, Relist, StoreError, TreePath,
    TreeStore, FEED_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Tree kept entirely in memory.
pub struct MemoryTreeStore {
    root: Arc<Mutex<Value>>,
    events: broadcast::Sender<NodeCreated>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Self {
            root: Arc::new(Mutex::new(Value::Object(Map::new()))),
            events,
        }
    }

    /// Start from an existing document, e.g. a JSON export of the tree.
    pub fn with_data(data: Value) -> Result<Self, StoreError> {
        if let Some(key) = find_invalid_key(&data) {
            return Err(StoreError::InvalidValue {
                path: key.to_string(),
                reason: "not a valid path segment",
            });
        }
        let (events, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Ok(Self {
            root: Arc::new(Mutex::new(
                normalize(data).unwrap_or_else(|| Value::Object(Map::new())),
            )),
            events,
        })
    }

    /// Copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        lock(&self.root)
    }
}

fn lock(root: &Mutex<Value>) -> MutexGuard<'_, Value> {
    // Writes are applied to the tree in one pass with no await in between,
    // so a poisoned guard still holds a consistent tree.
    root.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let root = self.lock();
        Ok(get_at(&root, path.segments()).cloned())
    }

    async fn update(&self, update: MultiPathUpdate) -> Result<(), StoreError> {
        update.validate()?;
        let mut root = self.lock();
        let created = created_nodes(&update, |path| get_at(&root, path.segments()).is_some());
        for (path, value) in update.into_entries() {
            set_at(&mut root, path.segments(), value);
        }
        for path in created {
            if let Some(value) = get_at(&root, path.segments()).cloned() {
                // No receivers is fine: nobody is subscribed yet.
                let _ = self.events.send(NodeCreated { path, value });
            }
        }
        Ok(())
    }

    async fn subscribe_child_added(&self, parent: &TreePath) -> Result<ChildFeed, StoreError> {
        // Subscribe and snapshot under the same lock so no insertion falls
        // between the two.
        let root = self.lock();
        let receiver = self.events.subscribe();
        let existing = get_at(&root, parent.segments())
            .map(children_of)
            .unwrap_or_default();
        let shared = Arc::clone(&self.root);
        let target = parent.clone();
        let relist: Relist = Box::new(move || {
            let children = get_at(&lock(&shared), target.segments())
                .map(children_of)
                .unwrap_or_default();
            async move { Ok::<_, StoreError>(children) }.boxed()
        });
        Ok(ChildFeed::new(parent.clone(), existing, receiver, relist))
    }
}
