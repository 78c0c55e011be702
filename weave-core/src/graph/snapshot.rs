//! Plain Snapshots
//!
//! A snapshot is a plain, computed-resolved copy of state. Objects and
//! arrays live in an arena owned by the snapshot and are referenced by
//! [`Handle`], so a snapshot can hold cycles and shared sub-objects without
//! any reference counting between composites. The arena itself is shared,
//! so cloning a snapshot is cheap.
//!
//! Snapshots convert to and from `serde_json::Value`. The conversion to
//! JSON fails on cyclic input: a tree-shaped format cannot hold a cycle.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Error as _, Serialize, Serializer};
use serde_json::Number;

use crate::error::SnapshotError;
use crate::reactive::SameValue;

/// Index of a composite inside a snapshot's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A plain value: a primitive or a reference to a composite.
#[derive(Debug, Clone)]
pub enum Plain {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Ref(Handle),
}

impl Plain {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Plain::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Plain::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Plain::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Plain::Ref(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Plain::Null)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Plain::Null => "null",
            Plain::Bool(_) => "a bool",
            Plain::Number(_) => "a number",
            Plain::String(_) => "a string",
            Plain::Ref(_) => "a composite",
        }
    }
}

/// Primitive equality. References compare by handle, which is only
/// meaningful within one snapshot.
impl PartialEq for Plain {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Plain::Null, Plain::Null) => true,
            (Plain::Bool(a), Plain::Bool(b)) => a == b,
            (Plain::Number(a), Plain::Number(b)) => a.same_value(b),
            (Plain::String(a), Plain::String(b)) => a == b,
            (Plain::Ref(a), Plain::Ref(b)) => a == b,
            _ => false,
        }
    }
}

/// An object or array in a snapshot.
#[derive(Debug, Clone)]
pub enum Composite {
    Object(IndexMap<String, Plain>),
    Array(Vec<Plain>),
}

impl Composite {
    pub fn len(&self) -> usize {
        match self {
            Composite::Object(map) => map.len(),
            Composite::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Child values with their keys (array positions as decimal strings).
    pub fn children(&self) -> Vec<(String, &Plain)> {
        match self {
            Composite::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Composite::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        }
    }
}

/// A plain, possibly cyclic, copy of state.
///
/// Every handle inside a snapshot refers to its own arena.
#[derive(Clone)]
pub struct Snapshot {
    nodes: Rc<Vec<Composite>>,
    root: Plain,
}

impl Snapshot {
    /// A snapshot holding a single primitive (or `null`).
    pub fn primitive(value: Plain) -> Self {
        let root = match value {
            Plain::Ref(_) => Plain::Null,
            other => other,
        };
        Self {
            nodes: Rc::new(Vec::new()),
            root,
        }
    }

    /// An empty object.
    pub fn empty_object() -> Self {
        let mut builder = SnapshotBuilder::new();
        let root = builder.object();
        builder.finish(Plain::Ref(root))
    }

    /// Start building a snapshot by hand (needed for cyclic graphs).
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    /// The root value.
    pub fn root(&self) -> &Plain {
        &self.root
    }

    /// The composite behind a handle.
    ///
    /// # Panics
    ///
    /// Panics if `handle` did not come from this snapshot. Use
    /// [`Snapshot::resolve`] for handles of unknown origin.
    pub fn composite(&self, handle: Handle) -> &Composite {
        &self.nodes[handle.index()]
    }

    /// The composite behind a value, if it is a reference into this
    /// snapshot.
    pub fn resolve(&self, value: &Plain) -> Option<&Composite> {
        value.as_handle().and_then(|handle| self.nodes.get(handle.index()))
    }

    /// The root composite, if the root is an object or array.
    pub fn root_composite(&self) -> Option<&Composite> {
        self.resolve(&self.root)
    }

    /// Number of composites in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a top-level key of a root object.
    pub fn get(&self, key: &str) -> Option<&Plain> {
        self.at(&[key])
    }

    /// Follow a path of keys (array positions as decimal strings).
    pub fn at(&self, path: &[&str]) -> Option<&Plain> {
        let mut current = &self.root;
        for segment in path {
            current = match self.resolve(current)? {
                Composite::Object(map) => map.get(*segment)?,
                Composite::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            };
        }
        Some(current)
    }

    /// Whether any composite is reachable from itself.
    pub fn is_cyclic(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            Open,
            Done,
        }

        fn visit(snapshot: &Snapshot, handle: Handle, marks: &mut [Mark]) -> bool {
            match marks[handle.index()] {
                Mark::Open => return true,
                Mark::Done => return false,
                Mark::Unseen => {}
            }
            marks[handle.index()] = Mark::Open;
            for (_, child) in snapshot.composite(handle).children() {
                if let Plain::Ref(next) = child {
                    if visit(snapshot, *next, marks) {
                        return true;
                    }
                }
            }
            marks[handle.index()] = Mark::Done;
            false
        }

        let mut marks = vec![Mark::Unseen; self.nodes.len()];
        (0..self.nodes.len()).any(|i| visit(self, Handle::new(i), &mut marks))
    }

    /// Extract the graph reachable from `value` as a standalone snapshot.
    ///
    /// Cycles and sharing inside the extracted part are preserved.
    pub fn subtree(&self, value: &Plain) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        let root = builder.embed_from(self, value);
        builder.finish(root)
    }

    /// Convert to a JSON tree.
    ///
    /// Shared sub-objects are duplicated; cycles are an error.
    pub fn to_json(&self) -> Result<serde_json::Value, SnapshotError> {
        let mut open = Vec::new();
        self.plain_to_json(&self.root, "", &mut open)
    }

    /// The root object's fields, or an error naming what the root is.
    pub(crate) fn expect_object(&self) -> Result<&IndexMap<String, Plain>, SnapshotError> {
        match self.root_composite() {
            Some(Composite::Object(map)) => Ok(map),
            Some(Composite::Array(_)) => Err(SnapshotError::NotAnObject { found: "an array" }),
            None => Err(SnapshotError::NotAnObject {
                found: self.root.kind_name(),
            }),
        }
    }

    fn plain_to_json(
        &self,
        value: &Plain,
        path: &str,
        open: &mut Vec<Handle>,
    ) -> Result<serde_json::Value, SnapshotError> {
        let handle = match value {
            Plain::Null => return Ok(serde_json::Value::Null),
            Plain::Bool(b) => return Ok(serde_json::Value::Bool(*b)),
            Plain::Number(n) => return Ok(number_to_json(*n)),
            Plain::String(s) => return Ok(serde_json::Value::String(s.clone())),
            Plain::Ref(handle) => *handle,
        };

        if open.contains(&handle) {
            return Err(SnapshotError::Cycle {
                path: path.to_string(),
            });
        }
        open.push(handle);

        let result = match self.composite(handle) {
            Composite::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    let child_path = child_path(path, key);
                    out.insert(key.clone(), self.plain_to_json(child, &child_path, open)?);
                }
                serde_json::Value::Object(out)
            }
            Composite::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, child) in items.iter().enumerate() {
                    let child_path = child_path(path, &index.to_string());
                    out.push(self.plain_to_json(child, &child_path, open)?);
                }
                serde_json::Value::Array(out)
            }
        };

        open.pop();
        Ok(result)
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE && !(n == 0.0 && n.is_sign_negative()) {
        return serde_json::Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Cycle-tolerant deep equality.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        super::diff::deep_equal(self, other)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Ok(json) => write!(f, "Snapshot({json})"),
            Err(_) => f
                .debug_struct("Snapshot")
                .field("root", &self.root)
                .field("nodes", &self.nodes)
                .finish(),
        }
    }
}

impl From<serde_json::Value> for Snapshot {
    fn from(json: serde_json::Value) -> Self {
        let mut builder = SnapshotBuilder::new();
        let root = builder.json(&json);
        builder.finish(root)
    }
}

impl From<&serde_json::Value> for Snapshot {
    fn from(json: &serde_json::Value) -> Self {
        let mut builder = SnapshotBuilder::new();
        let root = builder.json(json);
        builder.finish(root)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Snapshot::from)
    }
}

/// Anything that can be reduced to a plain snapshot.
pub trait ToSnapshot {
    fn to_snapshot(&self) -> Snapshot;
}

impl ToSnapshot for Snapshot {
    fn to_snapshot(&self) -> Snapshot {
        self.clone()
    }
}

impl ToSnapshot for serde_json::Value {
    fn to_snapshot(&self) -> Snapshot {
        Snapshot::from(self)
    }
}

impl<T: ToSnapshot + ?Sized> ToSnapshot for &T {
    fn to_snapshot(&self) -> Snapshot {
        (**self).to_snapshot()
    }
}

/// Incremental construction of a snapshot arena.
///
/// ```rust
/// use weave_core::graph::{Plain, Snapshot};
///
/// let mut builder = Snapshot::builder();
/// let root = builder.object();
/// builder.insert(root, "name", Plain::String("loop".into()));
/// builder.insert(root, "me", Plain::Ref(root));
/// let snapshot = builder.finish(Plain::Ref(root));
///
/// assert!(snapshot.is_cyclic());
/// assert!(snapshot.to_json().is_err());
/// ```
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    nodes: Vec<Composite>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty object.
    pub fn object(&mut self) -> Handle {
        self.nodes.push(Composite::Object(IndexMap::new()));
        Handle::new(self.nodes.len() - 1)
    }

    /// Allocate an empty array.
    pub fn array(&mut self) -> Handle {
        self.nodes.push(Composite::Array(Vec::new()));
        Handle::new(self.nodes.len() - 1)
    }

    /// Set a field on an object. Ignored if `object` is an array or was
    /// not allocated by this builder.
    pub fn insert(&mut self, object: Handle, key: impl Into<String>, value: Plain) {
        if let Some(Composite::Object(map)) = self.nodes.get_mut(object.index()) {
            map.insert(key.into(), value);
        }
    }

    /// Append to an array. Ignored if `array` is an object or was not
    /// allocated by this builder.
    pub fn push(&mut self, array: Handle, value: Plain) {
        if let Some(Composite::Array(items)) = self.nodes.get_mut(array.index()) {
            items.push(value);
        }
    }

    /// Copy the part of `source` reachable from `value` into this arena.
    pub fn embed_from(&mut self, source: &Snapshot, value: &Plain) -> Plain {
        let mut mapped = std::collections::HashMap::new();
        self.embed_value(source, value, &mut mapped)
    }

    /// Copy a whole snapshot into this arena and return its root.
    pub fn embed(&mut self, source: &Snapshot) -> Plain {
        self.embed_from(source, source.root())
    }

    fn embed_value(
        &mut self,
        source: &Snapshot,
        value: &Plain,
        mapped: &mut std::collections::HashMap<Handle, Handle>,
    ) -> Plain {
        let Plain::Ref(handle) = value else {
            return value.clone();
        };
        if let Some(existing) = mapped.get(handle) {
            return Plain::Ref(*existing);
        }

        let target = match source.composite(*handle) {
            Composite::Object(_) => self.object(),
            Composite::Array(_) => self.array(),
        };
        mapped.insert(*handle, target);

        match source.composite(*handle) {
            Composite::Object(map) => {
                for (key, child) in map {
                    let child = self.embed_value(source, child, mapped);
                    self.insert(target, key.clone(), child);
                }
            }
            Composite::Array(items) => {
                for child in items {
                    let child = self.embed_value(source, child, mapped);
                    self.push(target, child);
                }
            }
        }
        Plain::Ref(target)
    }

    /// Add a JSON tree and return its root value.
    pub fn json(&mut self, json: &serde_json::Value) -> Plain {
        match json {
            serde_json::Value::Null => Plain::Null,
            serde_json::Value::Bool(b) => Plain::Bool(*b),
            serde_json::Value::Number(n) => Plain::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Plain::String(s.clone()),
            serde_json::Value::Array(items) => {
                let handle = self.array();
                for item in items {
                    let child = self.json(item);
                    self.push(handle, child);
                }
                Plain::Ref(handle)
            }
            serde_json::Value::Object(map) => {
                let handle = self.object();
                for (key, item) in map {
                    let child = self.json(item);
                    self.insert(handle, key.clone(), child);
                }
                Plain::Ref(handle)
            }
        }
    }

    /// Seal the arena. References to handles this builder never allocated
    /// become `null`, so every handle in the result resolves.
    pub fn finish(mut self, root: Plain) -> Snapshot {
        let len = self.nodes.len();
        let dangling = |value: &Plain| matches!(value, Plain::Ref(handle) if handle.index() >= len);

        let mut dropped = 0usize;
        for composite in &mut self.nodes {
            let values: Box<dyn Iterator<Item = &mut Plain>> = match composite {
                Composite::Object(map) => Box::new(map.values_mut()),
                Composite::Array(items) => Box::new(items.iter_mut()),
            };
            for value in values {
                if dangling(value) {
                    *value = Plain::Null;
                    dropped += 1;
                }
            }
        }
        let root = if dangling(&root) {
            dropped += 1;
            Plain::Null
        } else {
            root
        };
        if dropped > 0 {
            tracing::warn!(dropped, "snapshot referenced handles from another builder; replaced with null");
        }

        Snapshot {
            nodes: Rc::new(self.nodes),
            root,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn self_loop() -> Snapshot {
        let mut builder = Snapshot::builder();
        let root = builder.object();
        builder.insert(root, "id", Plain::Number(1.0));
        builder.insert(root, "me", Plain::Ref(root));
        builder.finish(Plain::Ref(root))
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let value = json!({"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}});
        let snapshot = Snapshot::from(value.clone());
        assert_eq!(snapshot.to_json().unwrap(), value);
        assert_eq!(snapshot.at(&["b", "2"]), Some(&Plain::String("x".into())));
        assert_eq!(snapshot.get("a").and_then(Plain::as_f64), Some(1.0));
    }

    #[test]
    fn cyclic_snapshot_refuses_json() {
        let snapshot = self_loop();
        assert!(snapshot.is_cyclic());
        assert_eq!(
            snapshot.to_json(),
            Err(SnapshotError::Cycle { path: "me".into() })
        );
        assert!(serde_json::to_string(&snapshot).is_err());
    }

    #[test]
    fn shared_subobjects_are_not_cycles() {
        let mut builder = Snapshot::builder();
        let root = builder.object();
        let shared = builder.array();
        builder.push(shared, Plain::Number(1.0));
        builder.insert(root, "a", Plain::Ref(shared));
        builder.insert(root, "b", Plain::Ref(shared));
        let snapshot = builder.finish(Plain::Ref(root));

        assert!(!snapshot.is_cyclic());
        assert_eq!(snapshot.to_json().unwrap(), json!({"a": [1], "b": [1]}));
    }

    #[test]
    fn subtree_keeps_inner_cycles() {
        let mut builder = Snapshot::builder();
        let root = builder.object();
        let inner = builder.object();
        builder.insert(inner, "back", Plain::Ref(inner));
        builder.insert(root, "inner", Plain::Ref(inner));
        let snapshot = builder.finish(Plain::Ref(root));

        let extracted = snapshot.subtree(snapshot.get("inner").unwrap());
        assert_eq!(extracted.node_count(), 1);
        assert!(extracted.is_cyclic());
    }

    #[test]
    fn numbers_serialize_as_integers_when_integral() {
        let snapshot = Snapshot::from(json!({"n": 3.0, "f": 0.5}));
        assert_eq!(snapshot.to_json().unwrap(), json!({"n": 3, "f": 0.5}));
    }

    #[test]
    fn deserializes_from_json_text() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"count": 0}"#).unwrap();
        assert_eq!(snapshot, Snapshot::from(json!({"count": 0})));
    }

    #[test]
    fn handles_from_another_builder_become_null() {
        let mut other = Snapshot::builder();
        for _ in 0..8 {
            other.object();
        }
        let foreign = other.object();

        let mut builder = Snapshot::builder();
        let root = builder.object();
        builder.insert(foreign, "lost", Plain::Number(1.0));
        builder.push(foreign, Plain::Number(2.0));
        builder.insert(root, "link", Plain::Ref(foreign));
        let snapshot = builder.finish(Plain::Ref(root));

        assert_eq!(snapshot.node_count(), 1);
        assert_eq!(snapshot.get("link"), Some(&Plain::Null));
        assert!(snapshot.resolve(&Plain::Ref(foreign)).is_none());
        assert_eq!(snapshot.to_json().unwrap(), json!({"link": null}));
    }

    #[test]
    fn foreign_root_handle_is_dropped() {
        let mut other = Snapshot::builder();
        other.object();
        let foreign = other.array();
        let snapshot = Snapshot::builder().finish(Plain::Ref(foreign));
        assert_eq!(snapshot.root(), &Plain::Null);
    }

    #[test]
    fn non_object_roots_are_reported() {
        let snapshot = Snapshot::from(json!([1, 2]));
        assert_eq!(
            snapshot.expect_object().unwrap_err(),
            SnapshotError::NotAnObject { found: "an array" }
        );
    }
}
