//! Persisted shell variables
//!
//! Stores form a tree: a subshell forks a snapshot of its parent and writes
//! stay inside the fork. The only way out is [`VarStores::escape`], which
//! writes into the parent store.

use std::collections::HashMap;

use serde_json::Value;
use slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(usize);

/// Variable holding the status of the last completed step
pub const STATUS_VAR: &str = "?";

#[derive(Debug, Default)]
struct Store {
    vars: HashMap<String, Value>,
    parent: Option<StoreId>,
}

#[derive(Debug)]
pub struct VarStores {
    stores: Slab<Store>,
    root: StoreId,
}

impl Default for VarStores {
    fn default() -> Self {
        Self::new()
    }
}

impl VarStores {
    pub fn new() -> Self {
        let mut stores = Slab::new();
        let root = StoreId(stores.insert(Store::default()));
        Self { stores, root }
    }

    pub fn root(&self) -> StoreId {
        self.root
    }

    pub fn get(&self, store: StoreId, name: &str) -> Option<&Value> {
        self.stores.get(store.0)?.vars.get(name)
    }

    pub fn set(&mut self, store: StoreId, name: impl Into<String>, value: Value) {
        if let Some(s) = self.stores.get_mut(store.0) {
            s.vars.insert(name.into(), value);
        }
    }

    pub fn unset(&mut self, store: StoreId, name: &str) -> Option<Value> {
        self.stores.get_mut(store.0)?.vars.remove(name)
    }

    /// Snapshot `parent` into a new child store
    pub fn fork(&mut self, parent: StoreId) -> StoreId {
        let vars = self
            .stores
            .get(parent.0)
            .map(|s| s.vars.clone())
            .unwrap_or_default();
        StoreId(self.stores.insert(Store {
            vars,
            parent: Some(parent),
        }))
    }

    /// Write through to the parent of `store` (the store itself for the root)
    pub fn escape(&mut self, store: StoreId, name: impl Into<String>, value: Value) {
        let target = self
            .stores
            .get(store.0)
            .and_then(|s| s.parent)
            .unwrap_or(store);
        self.set(target, name, value);
    }

    /// Drop a forked store. The root is never released.
    pub fn release(&mut self, store: StoreId) {
        if store != self.root && self.stores.contains(store.0) {
            self.stores.remove(store.0);
        }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_unset() {
        let mut vars = VarStores::new();
        let root = vars.root();
        vars.set(root, "A", json!("1"));
        assert_eq!(vars.get(root, "A"), Some(&json!("1")));
        assert_eq!(vars.unset(root, "A"), Some(json!("1")));
        assert_eq!(vars.get(root, "A"), None);
    }

    #[test]
    fn test_fork_is_snapshot() {
        let mut vars = VarStores::new();
        let root = vars.root();
        vars.set(root, "A", json!("outer"));

        let child = vars.fork(root);
        assert_eq!(vars.get(child, "A"), Some(&json!("outer")));

        vars.set(child, "A", json!("inner"));
        vars.set(root, "B", json!("late"));
        assert_eq!(vars.get(root, "A"), Some(&json!("outer")));
        assert_eq!(vars.get(child, "B"), None);
    }

    #[test]
    fn test_escape_writes_parent() {
        let mut vars = VarStores::new();
        let root = vars.root();
        let child = vars.fork(root);
        vars.escape(child, "OUT", json!(1));
        assert_eq!(vars.get(root, "OUT"), Some(&json!(1)));
        assert_eq!(vars.get(child, "OUT"), None);

        vars.escape(root, "TOP", json!(2));
        assert_eq!(vars.get(root, "TOP"), Some(&json!(2)));
    }

    #[test]
    fn test_release_keeps_root() {
        let mut vars = VarStores::new();
        let root = vars.root();
        let child = vars.fork(root);
        assert_eq!(vars.len(), 2);
        vars.release(child);
        vars.release(root);
        assert_eq!(vars.len(), 1);
    }
}
