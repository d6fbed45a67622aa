use super::json_tree::{children_of, get_at};
use super::{MultiPathUpdate, StoreError, TreePath};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the in-process creation broadcast shared by feeds.
pub const FEED_CHANNEL_CAPACITY: usize = 4096;

/// A node that did not exist before an update and exists after it.
#[derive(Debug, Clone)]
pub struct NodeCreated {
    pub path: TreePath,
    pub value: Value,
}

impl NodeCreated {
    /// Children of `parent` that came into existence with this node.
    fn children_under(&self, parent: &TreePath) -> Vec<ChildEvent> {
        if self.path.parent().as_ref() == Some(parent) {
            if let Some(key) = self.path.last() {
                return vec![ChildEvent {
                    key: key.to_string(),
                    value: self.value.clone(),
                }];
            }
        }
        // The created node is `parent` itself or one of its ancestors: every
        // child of `parent` inside it is new.
        if let Some(relative) = self.path.relative(parent) {
            if let Some(node) = get_at(&self.value, relative) {
                return children_of(node)
                    .into_iter()
                    .map(|(key, value)| ChildEvent { key, value })
                    .collect();
            }
        }
        Vec::new()
    }
}

/// Lists the current children of a feed's parent, used to recover after the
/// feed fell behind the creation broadcast.
pub type Relist =
    Box<dyn Fn() -> BoxFuture<'static, Result<Vec<(String, Value)>, StoreError>> + Send + Sync>;

/// One child observed under a subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub key: String,
    pub value: Value,
}

/// Insertion feed for the children of one path.
///
/// Yields every child present when the subscription was made, then every
/// child inserted afterwards. A child may be seen twice around the moment of
/// subscription, and after the feed lagged it replays every current child;
/// consumers must be idempotent.
pub struct ChildFeed {
    parent: TreePath,
    pending: VecDeque<ChildEvent>,
    receiver: broadcast::Receiver<NodeCreated>,
    relist: Relist,
    needs_relist: bool,
}

impl ChildFeed {
    pub fn new(
        parent: TreePath,
        existing: Vec<(String, Value)>,
        receiver: broadcast::Receiver<NodeCreated>,
        relist: Relist,
    ) -> Self {
        Self {
            parent,
            pending: existing
                .into_iter()
                .map(|(key, value)| ChildEvent { key, value })
                .collect(),
            receiver,
            relist,
            needs_relist: false,
        }
    }

    pub fn parent(&self) -> &TreePath {
        &self.parent
    }

    /// Wait for the next child. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<ChildEvent> {
        loop {
            if self.needs_relist {
                match (self.relist)().await {
                    Ok(children) => {
                        self.needs_relist = false;
                        self.pending.extend(
                            children
                                .into_iter()
                                .map(|(key, value)| ChildEvent { key, value }),
                        );
                    }
                    // Retried on the next wake-up.
                    Err(e) => warn!("Could not re-list children of {}: {}", self.parent, e),
                }
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.receiver.recv().await {
                Ok(created) => self.pending.extend(created.children_under(&self.parent)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        "Child feed for {} lagged by {} creation events, re-listing children",
                        self.parent, missed
                    );
                    self.needs_relist = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Topmost nodes that `update` brings into existence, given an existence
/// check against the tree as it was before the update.
pub fn created_nodes(
    update: &MultiPathUpdate,
    mut exists: impl FnMut(&TreePath) -> bool,
) -> Vec<TreePath> {
    let mut created: Vec<TreePath> = Vec::new();
    for (path, value) in update.iter() {
        if value.is_none() {
            continue;
        }
        let mut prefix = TreePath::root();
        for segment in path.segments() {
            prefix = prefix.child(segment);
            if !exists(&prefix) {
                created.push(prefix.clone());
                break;
            }
        }
    }
    created.sort();
    created.dedup();
    created
        .iter()
        .filter(|path| !created.iter().any(|other| other != *path && other.contains(path)))
        .cloned()
        .collect()
}
