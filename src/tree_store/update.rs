use super::json_tree::{find_invalid_key, normalize};
use super::{StoreError, TreePath};
use serde_json::Value;
use std::collections::BTreeMap;

/// A set of writes applied to the tree as one atomic unit.
///
/// Each entry either replaces the node at its path or removes it (`None`).
/// No entry may sit below another entry of the same update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiPathUpdate {
    entries: BTreeMap<TreePath, Option<Value>>,
}

impl MultiPathUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node at `path`. Null or empty values remove it.
    pub fn set(&mut self, path: TreePath, value: Value) -> &mut Self {
        self.entries.insert(path, normalize(value));
        self
    }

    pub fn remove(&mut self, path: TreePath) -> &mut Self {
        self.entries.insert(path, None);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &TreePath) -> Option<&Option<Value>> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TreePath, &Option<Value>)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (TreePath, Option<Value>)> {
        self.entries.into_iter()
    }

    /// Reject updates where one path is an ancestor of another; the result
    /// would depend on application order. Values may only hold keys that are
    /// valid path segments.
    pub fn validate(&self) -> Result<(), StoreError> {
        for (path, value) in &self.entries {
            if value.as_ref().and_then(find_invalid_key).is_some() {
                return Err(StoreError::InvalidValue {
                    path: path.to_string(),
                    reason: "contains a key that is not a valid path segment",
                });
            }
        }
        // Sorted order puts every descendant right after its ancestor.
        let mut previous: Option<&TreePath> = None;
        for path in self.entries.keys() {
            if let Some(prev) = previous {
                if prev.contains(path) {
                    return Err(StoreError::ConflictingUpdate {
                        ancestor: prev.to_string(),
                        descendant: path.to_string(),
                    });
                }
            }
            previous = Some(path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    #[test]
    fn set_normalizes_values() {
        let mut update = MultiPathUpdate::new();
        update.set(p("posts/p1"), json!({"applications": {}}));
        update.set(p("posts/p2"), json!(null));
        assert_eq!(update.get(&p("posts/p1")), Some(&None));
        assert_eq!(update.get(&p("posts/p2")), Some(&None));
    }

    #[test]
    fn sibling_paths_are_valid() {
        let mut update = MultiPathUpdate::new();
        update
            .set(p("users/u1/applications/a1"), json!(true))
            .set(p("posts/p1/applications/a1"), json!(true));
        assert!(update.validate().is_ok());
        assert_eq!(update.len(), 2);
    }

    #[test]
    fn nested_paths_are_rejected() {
        let mut update = MultiPathUpdate::new();
        update
            .set(p("posts/p1"), json!({"category": "x"}))
            .remove(p("posts/p1/applications"));
        assert!(matches!(
            update.validate(),
            Err(StoreError::ConflictingUpdate { .. })
        ));
    }

    #[test]
    fn values_with_unaddressable_keys_are_rejected() {
        let mut update = MultiPathUpdate::new();
        update.set(p("posts/p1"), json!({"applications": {"a.1": true}}));
        assert!(matches!(
            update.validate(),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn similar_prefix_is_not_nesting() {
        let mut update = MultiPathUpdate::new();
        update
            .set(p("posts/p1"), json!(1))
            .set(p("posts/p10/applications/a"), json!(true));
        assert!(update.validate().is_ok());
    }
}
