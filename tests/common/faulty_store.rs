//! A tree store that fails on demand.
#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use boardkeeper::tree_store::{ChildFeed, MultiPathUpdate, StoreError};
use boardkeeper::{MemoryTreeStore, TreePath, TreeStore};
use serde_json::Value;
use std::sync::Mutex;

struct Fault {
    prefix: TreePath,
    /// `None` fails forever.
    remaining: Option<usize>,
}

impl Fault {
    /// Consume one failure if this fault is still armed.
    fn trip(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// Wraps a [`MemoryTreeStore`] and fails reads or writes touching configured
/// paths.
///
/// A read fails when it overlaps a read fault in either direction, since
/// reading an ancestor returns the faulty subtree too. A write fails when any
/// of its entries is at or below a write fault, and then changes nothing.
pub struct FaultyTreeStore {
    inner: MemoryTreeStore,
    read_faults: Mutex<Vec<Fault>>,
    write_faults: Mutex<Vec<Fault>>,
}

impl FaultyTreeStore {
    pub fn with_data(data: Value) -> Self {
        Self {
            inner: MemoryTreeStore::with_data(data).unwrap(),
            read_faults: Mutex::new(Vec::new()),
            write_faults: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_reads_of(&self, prefix: &str) {
        self.read_faults.lock().unwrap().push(Fault {
            prefix: TreePath::parse(prefix).unwrap(),
            remaining: None,
        });
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        self.fail_writes_times(prefix, None);
    }

    /// Fail the next `times` writes under `prefix`, or every one for `None`.
    pub fn fail_writes_times(&self, prefix: &str, times: Option<usize>) {
        self.write_faults.lock().unwrap().push(Fault {
            prefix: TreePath::parse(prefix).unwrap(),
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.read_faults.lock().unwrap().clear();
        self.write_faults.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> Value {
        self.inner.snapshot()
    }
}

#[async_trait]
impl TreeStore for FaultyTreeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let tripped = self
            .read_faults
            .lock()
            .unwrap()
            .iter_mut()
            .any(|f| (f.prefix.contains(path) || path.contains(&f.prefix)) && f.trip());
        if tripped {
            return Err(StoreError::read(path, anyhow!("injected read failure")));
        }
        self.inner.get(path).await
    }

    async fn update(&self, update: MultiPathUpdate) -> Result<(), StoreError> {
        let failing = {
            let mut faults = self.write_faults.lock().unwrap();
            update
                .iter()
                .map(|(path, _)| path)
                .find(|path| {
                    faults
                        .iter_mut()
                        .any(|f| f.prefix.contains(path) && f.trip())
                })
                .cloned()
        };
        if let Some(path) = failing {
            return Err(StoreError::write(path, anyhow!("injected write failure")));
        }
        self.inner.update(update).await
    }

    async fn subscribe_child_added(&self, parent: &TreePath) -> Result<ChildFeed, StoreError> {
        self.inner.subscribe_child_added(parent).await
    }
}
