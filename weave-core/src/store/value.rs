//! Values, slots and keys.
//!
//! Three closely related types describe what lives in a store:
//!
//! - [`Value`] is what reads return. Objects and arrays come back as
//!   [`Node`] handles, so two reads of the same field compare equal by
//!   identity.
//! - `Slot` is what a signal actually stores: a primitive, a handle into
//!   the store's node arena, or a computed definition.
//! - [`Input`] is what writes accept: an existing value, a plain graph to
//!   import, or a computed definition to install.

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use crate::graph::Snapshot;
use crate::reactive::{Computed, SameValue};

use super::node::Node;

/// Keys reserved for the batch-control operations of a store.
///
/// They can never be written as data keys on the root object and are left
/// out of snapshots and diffs.
pub const RESERVED_KEYS: [&str; 3] = ["batch", "beginBatch", "commitBatch"];

/// Returns true if `key` names a batch-control operation.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Address of a node in a store's arena.
///
/// Slots are reused once a node is collected; the generation tells a stale
/// id apart from the node that took its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// The root object of every store.
    pub const ROOT: NodeId = NodeId {
        index: 0,
        generation: 0,
    };

    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// Position of the node in the arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Whether a node holds named fields or a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Array,
}

/// A field name or an array position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Index(usize),
}

impl Key {
    /// The key as an object field name.
    pub fn as_name(&self) -> String {
        match self {
            Key::Name(name) => name.clone(),
            Key::Index(index) => index.to_string(),
        }
    }

    /// The key as an array position, if it is one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Index(index) => Some(*index),
            Key::Name(name) => name.parse().ok(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => f.write_str(name),
            Key::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Key::Name(name.clone())
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

/// Join a parent path and a key into a dotted path.
pub(crate) fn join_path(parent: &str, key: &Key) -> String {
    if parent.is_empty() {
        key.as_name()
    } else {
        format!("{parent}.{key}")
    }
}

/// The content of a field's signal.
#[derive(Clone)]
pub(crate) enum Slot {
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Node(NodeId),
    Computed(Computed),
}

impl SameValue for Slot {
    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Slot::Null, Slot::Null) => true,
            (Slot::Bool(a), Slot::Bool(b)) => a == b,
            (Slot::Number(a), Slot::Number(b)) => a.same_value(b),
            (Slot::String(a), Slot::String(b)) => a == b,
            (Slot::Node(a), Slot::Node(b)) => a == b,
            (Slot::Computed(a), Slot::Computed(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Null => f.write_str("Null"),
            Slot::Bool(b) => write!(f, "Bool({b})"),
            Slot::Number(n) => write!(f, "Number({n})"),
            Slot::String(s) => write!(f, "String({s:?})"),
            Slot::Node(id) => write!(f, "Node({})", id.index()),
            Slot::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// A value read from a store.
///
/// Equality is identity equality: numbers compare with `NaN == NaN` and
/// `+0 != -0`, objects and arrays compare by node identity.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Object(Node),
    Array(Node),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The node behind an object or array value.
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Object(node) | Value::Array(node) => Some(node),
            _ => None,
        }
    }

    /// Read a field of an object or an element of an array.
    ///
    /// Returns [`Value::Null`] for primitives and missing keys, which keeps
    /// chained reads like `store.get("user").get("name")` short.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        match self.as_node() {
            Some(node) => node.get(key),
            None => Value::Null,
        }
    }

    /// Total order used by [`Node::sort`]: null, bools, numbers, strings,
    /// then containers by arena position.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(value: &Value) -> u8 {
            match value {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::String(_) => 3,
                Value::Object(_) | Value::Array(_) => 4,
            }
        }

        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (a, b) if rank(a) == 4 && rank(b) == 4 => {
                let (a, b) = (a.as_node(), b.as_node());
                a.map(|n| n.id()).cmp(&b.map(|n| n.id()))
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.same_value(b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) | (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl SameValue for Value {
    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        node.to_value()
    }
}

/// What a write accepts.
#[derive(Clone, Debug)]
pub enum Input {
    /// An existing value. Nodes of the same store are stored by identity,
    /// which is how cycles and shared sub-objects are created.
    Value(Value),
    /// A plain graph, imported as fresh nodes.
    Snapshot(Snapshot),
    /// A computed definition to install under the key.
    Computed(Computed),
}

macro_rules! input_from_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Input {
            fn from(value: $ty) -> Self {
                Input::Value(Value::from(value))
            }
        })*
    };
}

input_from_value!((), bool, f64, i32, i64, u32, usize, &str, String, Rc<str>, Node);

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<Snapshot> for Input {
    fn from(snapshot: Snapshot) -> Self {
        Input::Snapshot(snapshot)
    }
}

impl From<serde_json::Value> for Input {
    fn from(json: serde_json::Value) -> Self {
        Input::Snapshot(Snapshot::from(json))
    }
}

impl From<Computed> for Input {
    fn from(computed: Computed) -> Self {
        Input::Computed(computed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
