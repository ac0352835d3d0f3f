//! StateTree — a path-addressed JSON tree with diff capture.
//!
//! Paths are ordered key lists (`["monitor", "services", "ns/svc/web"]`).
//! Every mutation through [`StateTree::set`], [`StateTree::merge`] or
//! [`StateTree::unset`] appends a [`Delta`] to a pending list;
//! [`StateTree::pop_diff`] takes that list and stamps it with the next
//! generation. [`StateTree::patch`] applies a delta list atomically: either
//! every delta applies, or the tree is left untouched.
//!
//! When a `set` has to create intermediate maps, the recorded delta is
//! anchored at the highest created ancestor so that the same delta applies
//! cleanly on a replica that has never seen the parent.

use std::mem;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StateError, StateResult};

/// One change: the value at `path` becomes `value`, or is removed when
/// `value` is `null`. Serialized as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta(pub Vec<String>, pub Value);

impl Delta {
    pub fn set<S: AsRef<str>>(path: &[S], value: Value) -> Self {
        Delta(key_path(path), value)
    }

    pub fn unset<S: AsRef<str>>(path: &[S]) -> Self {
        Delta(key_path(path), Value::Null)
    }

    pub fn path(&self) -> &[String] {
        &self.0
    }

    /// The new value, or `None` for a removal.
    pub fn value(&self) -> Option<&Value> {
        if self.1.is_null() { None } else { Some(&self.1) }
    }
}

/// The changes accumulated between two `pop_diff` calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    pub generation: u64,
    pub deltas: Vec<Delta>,
}

/// Convert a borrowed path into an owned key list.
pub fn key_path<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    path.iter().map(|s| s.as_ref().to_string()).collect()
}

struct Inner {
    root: Value,
    generation: u64,
    pending: Vec<Delta>,
}

/// Thread-safe state tree. All operations take one exclusive lock, so diff
/// capture and patch application are linearizable with concurrent writes.
pub struct StateTree {
    inner: Mutex<Inner>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    /// An empty tree (root is an empty map) at generation 0.
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    pub fn from_value(root: Value) -> Self {
        Self {
            inner: Mutex::new(Inner {
                root,
                generation: 0,
                pending: Vec::new(),
            }),
        }
    }

    /// Generation of the last popped diff.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        let inner = self.inner.lock();
        lookup(&inner.root, path).cloned()
    }

    /// Read and deserialize the value at `path`.
    pub fn get_as<T: DeserializeOwned, S: AsRef<str>>(&self, path: &[S]) -> StateResult<Option<T>> {
        match self.get(path) {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| StateError::Deserialize(e.to_string())),
            None => Ok(None),
        }
    }

    /// Set the value at `path`, creating missing parent maps. Setting `null`
    /// is an unset.
    pub fn set<S: AsRef<str>>(&self, path: &[S], value: Value) -> StateResult<()> {
        let path = key_path(path);
        let mut inner = self.inner.lock();
        inner.set(&path, value)
    }

    pub fn set_as<T: Serialize, S: AsRef<str>>(&self, path: &[S], value: &T) -> StateResult<()> {
        let value = serde_json::to_value(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.set(path, value)
    }

    /// Deep-merge a map into the map at `path`. Non-map values replace.
    pub fn merge<S: AsRef<str>>(&self, path: &[S], value: Value) -> StateResult<()> {
        let path = key_path(path);
        let mut inner = self.inner.lock();
        inner.merge(path, value)
    }

    /// Remove the value at `path`. Returns whether something was removed.
    pub fn unset<S: AsRef<str>>(&self, path: &[S]) -> StateResult<bool> {
        let path = key_path(path);
        let mut inner = self.inner.lock();
        inner.unset(&path)
    }

    /// Take the pending changes, stamped with a new generation. Returns
    /// `None` (and keeps the generation) when nothing changed.
    pub fn pop_diff(&self) -> Option<Diff> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            return None;
        }
        inner.generation += 1;
        Some(Diff {
            generation: inner.generation,
            deltas: mem::take(&mut inner.pending),
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    /// Apply an ordered delta list. Nothing is recorded as pending and the
    /// tree is unchanged if any delta fails.
    pub fn patch(&self, deltas: &[Delta]) -> StateResult<()> {
        let mut inner = self.inner.lock();
        let mut root = inner.root.clone();
        apply_deltas(&mut root, deltas)?;
        inner.root = root;
        Ok(())
    }

    /// A deep copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.inner.lock().root.clone()
    }

    /// Run `f` against the tree under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.root)
    }
}

impl Inner {
    fn set(&mut self, path: &[String], value: Value) -> StateResult<()> {
        if value.is_null() {
            return self.unset(path).map(|_| ());
        }
        if let Some(delta) = set_path(&mut self.root, path, value)? {
            self.pending.push(delta);
        }
        Ok(())
    }

    fn unset(&mut self, path: &[String]) -> StateResult<bool> {
        let removed = unset_path(&mut self.root, path)?;
        if removed {
            self.pending.push(Delta(path.to_vec(), Value::Null));
        }
        Ok(removed)
    }

    fn merge(&mut self, path: Vec<String>, value: Value) -> StateResult<()> {
        match value {
            Value::Object(incoming) if matches!(lookup(&self.root, &path), Some(Value::Object(_))) => {
                for (key, v) in incoming {
                    let mut child = path.clone();
                    child.push(key);
                    self.merge(child, v)?;
                }
                Ok(())
            }
            other => self.set(&path, other),
        }
    }
}

/// Borrow the value at `path`.
pub fn lookup<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut node = root;
    for key in path {
        node = node.as_object()?.get(key.as_ref())?;
    }
    Some(node)
}

/// Apply deltas in order on a plain value. Used for replicas that do not
/// track their own changes.
pub fn apply_deltas(root: &mut Value, deltas: &[Delta]) -> StateResult<()> {
    for delta in deltas {
        apply_delta(root, delta)?;
    }
    Ok(())
}

/// Apply one delta. The parent of the target path must exist and be a map.
pub fn apply_delta(root: &mut Value, delta: &Delta) -> StateResult<()> {
    let path = delta.path();
    let (last, parents) = path.split_last().ok_or(StateError::EmptyPath)?;
    let mut node = root;
    for (depth, key) in parents.iter().enumerate() {
        node = node
            .as_object_mut()
            .and_then(|m| m.get_mut(key))
            .ok_or_else(|| StateError::structural(&path[..=depth]))?;
    }
    let map = node
        .as_object_mut()
        .ok_or_else(|| StateError::structural(parents))?;
    match delta.value() {
        Some(v) => {
            map.insert(last.clone(), v.clone());
        }
        None => {
            map.remove(last);
        }
    }
    Ok(())
}

fn set_path(root: &mut Value, path: &[String], value: Value) -> StateResult<Option<Delta>> {
    let (last, parents) = path.split_last().ok_or(StateError::EmptyPath)?;
    let mut created_at: Option<usize> = None;
    let mut node = &mut *root;
    for (depth, key) in parents.iter().enumerate() {
        let Value::Object(map) = node else {
            return Err(StateError::structural(&path[..depth]));
        };
        if !map.contains_key(key) {
            map.insert(key.clone(), Value::Object(Map::new()));
            created_at.get_or_insert(depth);
        }
        node = map
            .get_mut(key)
            .ok_or_else(|| StateError::structural(&path[..=depth]))?;
    }
    let Value::Object(map) = node else {
        return Err(StateError::structural(parents));
    };
    if created_at.is_none() && map.get(last) == Some(&value) {
        return Ok(None);
    }
    map.insert(last.clone(), value.clone());

    match created_at {
        Some(depth) => {
            let anchor = path[..=depth].to_vec();
            let anchored = lookup(root, &anchor).cloned().unwrap_or(Value::Null);
            Ok(Some(Delta(anchor, anchored)))
        }
        None => Ok(Some(Delta(path.to_vec(), value))),
    }
}

fn unset_path(root: &mut Value, path: &[String]) -> StateResult<bool> {
    let (last, parents) = path.split_last().ok_or(StateError::EmptyPath)?;
    let mut node = root;
    for key in parents {
        match node.as_object_mut().and_then(|m| m.get_mut(key)) {
            Some(child) => node = child,
            None => return Ok(false),
        }
    }
    Ok(node
        .as_object_mut()
        .map(|m| m.remove(last).is_some())
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get() {
        let tree = StateTree::new();
        tree.set(&["monitor", "status"], json!("idle")).unwrap();
        assert_eq!(tree.get(&["monitor", "status"]), Some(json!("idle")));
        assert_eq!(tree.get(&["monitor", "missing"]), None);
    }

    #[test]
    fn set_anchors_delta_at_created_parent() {
        let tree = StateTree::new();
        tree.set(&["services", "status", "svc1"], json!({"avail": "up"}))
            .unwrap();

        let diff = tree.pop_diff().unwrap();
        assert_eq!(diff.generation, 1);
        assert_eq!(
            diff.deltas,
            vec![Delta::set(
                &["services"],
                json!({"status": {"svc1": {"avail": "up"}}})
            )]
        );
    }

    #[test]
    fn unchanged_set_records_nothing() {
        let tree = StateTree::new();
        tree.set(&["a"], json!(1)).unwrap();
        tree.pop_diff();
        tree.set(&["a"], json!(1)).unwrap();
        assert!(tree.pop_diff().is_none());
        assert_eq!(tree.generation(), 1);
    }

    #[test]
    fn set_through_scalar_is_structural() {
        let tree = StateTree::new();
        tree.set(&["a"], json!(1)).unwrap();
        let err = tree.set(&["a", "b"], json!(2)).unwrap_err();
        assert!(matches!(err, StateError::Structural { .. }));
    }

    #[test]
    fn merge_keeps_siblings() {
        let tree = StateTree::new();
        tree.set(&["labels"], json!({"zone": "a", "rack": "1"}))
            .unwrap();
        tree.pop_diff();

        tree.merge(&["labels"], json!({"rack": "2"})).unwrap();
        assert_eq!(tree.get(&["labels"]), Some(json!({"zone": "a", "rack": "2"})));

        let diff = tree.pop_diff().unwrap();
        assert_eq!(diff.deltas, vec![Delta::set(&["labels", "rack"], json!("2"))]);
    }

    #[test]
    fn unset_records_null_delta() {
        let tree = StateTree::new();
        tree.set(&["locks", "l1"], json!({"id": "x"})).unwrap();
        tree.pop_diff();

        assert!(tree.unset(&["locks", "l1"]).unwrap());
        assert!(!tree.unset(&["locks", "l1"]).unwrap());
        let diff = tree.pop_diff().unwrap();
        assert_eq!(diff.deltas, vec![Delta::unset(&["locks", "l1"])]);
    }

    #[test]
    fn patch_on_missing_parent_leaves_tree_untouched() {
        let tree = StateTree::from_value(json!({"a": {"b": 1}}));
        let deltas = vec![
            Delta::set(&["a", "c"], json!(2)),
            Delta::set(&["x", "y"], json!(3)),
        ];
        let err = tree.patch(&deltas).unwrap_err();
        assert!(matches!(err, StateError::Structural { .. }));
        assert_eq!(tree.snapshot(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn replica_converges_through_diffs() {
        let tree = StateTree::new();
        let mut replica = json!({});

        tree.set(&["monitor", "status"], json!("init")).unwrap();
        tree.set(&["services", "status", "s1"], json!({"avail": "down"}))
            .unwrap();
        let d1 = tree.pop_diff().unwrap();

        tree.set(&["monitor", "status"], json!("idle")).unwrap();
        tree.merge(&["services", "status", "s1"], json!({"avail": "up"}))
            .unwrap();
        tree.set(&["services", "status", "s2"], json!({"avail": "down"}))
            .unwrap();
        let d2 = tree.pop_diff().unwrap();

        tree.unset(&["services", "status", "s2"]).unwrap();
        let d3 = tree.pop_diff().unwrap();

        for diff in [d1, d2, d3] {
            apply_deltas(&mut replica, &diff.deltas).unwrap();
        }
        assert_eq!(replica, tree.snapshot());
    }

    #[test]
    fn delta_wire_format_is_pair() {
        let d = Delta::set(&["a", "b"], json!(1));
        assert_eq!(serde_json::to_value(&d).unwrap(), json!([["a", "b"], 1]));
        let back: Delta = serde_json::from_value(json!([["a"], null])).unwrap();
        assert!(back.value().is_none());
    }
}
