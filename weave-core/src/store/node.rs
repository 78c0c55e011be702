//! Node handles.
//!
//! A [`Node`] is a handle to one object or array in a store's arena. It is
//! what reads return for nested values and what computed getters receive.
//! Handles are cheap to clone and compare by identity.

use std::cmp::Ordering;
use std::fmt;

use super::value::{Input, Key, NodeId, NodeKind, Slot, Value};
use super::Store;
use crate::error::Result;
use crate::graph::{Snapshot, ToSnapshot};

/// A handle to an object or array held by a [`Store`].
///
/// A live handle keeps its node in the arena even after the node is
/// detached from the state, so it stays readable and writable.
pub struct Node {
    store: Store,
    id: NodeId,
}

impl Node {
    pub(crate) fn new(store: Store, id: NodeId) -> Self {
        store.pin(id);
        Self { store, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The store this node belongs to.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn kind(&self) -> NodeKind {
        self.store.kind_of(self.id)
    }

    pub fn is_array(&self) -> bool {
        self.kind() == NodeKind::Array
    }

    /// Dotted path at which the node was first attached (`""` for the root).
    pub fn path(&self) -> String {
        self.store.path_of(self.id)
    }

    /// Identity of this node across stores.
    pub(crate) fn binding_context(&self) -> (usize, NodeId) {
        self.store.binding_context(self.id)
    }

    /// This node as a [`Value::Object`] or [`Value::Array`].
    pub fn to_value(&self) -> Value {
        match self.kind() {
            NodeKind::Object => Value::Object(self.clone()),
            NodeKind::Array => Value::Array(self.clone()),
        }
    }

    /// Read a field or element.
    ///
    /// Computed fields are evaluated (or served from cache). Missing keys
    /// read as [`Value::Null`] and track the node's shape, so the reader
    /// hears when the key appears.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        self.store.read(self.id, &key.into())
    }

    /// Write a field or element.
    ///
    /// - A [`Computed`](crate::Computed) installs a definition under the key.
    /// - A plain value assigned to a computed key goes to its setter, or
    ///   fails with [`StoreError::ComputedWithoutSetter`](crate::StoreError).
    /// - Otherwise the field is written if the value differs by identity.
    ///
    /// Objects from the same store are stored by reference; snapshots, JSON
    /// and nodes of other stores are copied in.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Input>) -> Result<()> {
        self.store.write(self.id, key.into(), value.into())
    }

    /// Remove a field. Returns whether it existed.
    ///
    /// Deleting an array element leaves `null` in its place.
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        self.store.delete_at(self.id, key.into())
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.store.contains_tracked(self.id, &key.into())
    }

    /// Field names, or positions as strings for arrays.
    pub fn keys(&self) -> Vec<String> {
        self.store.names_tracked(self.id)
    }

    pub fn len(&self) -> usize {
        self.store.len_tracked(self.id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every element of an array (or field value of an object), in order.
    pub fn values(&self) -> Vec<Value> {
        self.keys().into_iter().map(|key| self.get(key)).collect()
    }

    /// Plain copy of the graph reachable from this node.
    pub fn to_snapshot(&self) -> Snapshot {
        self.store.capture_from(self.id)
    }

    // ------------------------------------------------------------------
    // Array operations
    // ------------------------------------------------------------------

    /// Append an element and return the new length.
    pub fn push(&self, value: impl Into<Input>) -> Result<usize> {
        let position = self.store_len();
        let slot = self.slot_for(position, value.into());
        self.store.mutate_array(self.id, "push", |items| {
            items.push(slot);
            items.len()
        })
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Value> {
        let removed = self.store.mutate_array(self.id, "pop", |items| items.pop())?;
        Ok(self.value_of(removed))
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> Result<Value> {
        let removed = self.store.mutate_array(self.id, "shift", |items| {
            (!items.is_empty()).then(|| items.remove(0))
        })?;
        Ok(self.value_of(removed))
    }

    /// Prepend an element and return the new length.
    pub fn unshift(&self, value: impl Into<Input>) -> Result<usize> {
        let slot = self.slot_for(0, value.into());
        self.store.mutate_array(self.id, "unshift", |items| {
            items.insert(0, slot);
            items.len()
        })
    }

    /// Remove `delete_count` elements at `start`, insert `items` there, and
    /// return the removed elements. Out-of-range arguments are clamped.
    pub fn splice<I, V>(&self, start: usize, delete_count: usize, items: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Input>,
    {
        let inserted: Vec<Slot> = items
            .into_iter()
            .enumerate()
            .map(|(offset, item)| self.slot_for(start + offset, item.into()))
            .collect();

        let removed = self.store.mutate_array(self.id, "splice", |slots| {
            let start = start.min(slots.len());
            let end = start + delete_count.min(slots.len() - start);
            slots.splice(start..end, inserted).collect::<Vec<_>>()
        })?;

        Ok(removed
            .into_iter()
            .map(|slot| self.store.resolve(self.id, slot))
            .collect())
    }

    /// Sort the elements with a comparator over their values.
    pub fn sort_by<F>(&self, mut compare: F) -> Result<()>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        let store = self.store.clone();
        let id = self.id;
        self.store.mutate_array(self.id, "sort", move |slots| {
            let mut keyed: Vec<(Slot, Value)> = slots
                .drain(..)
                .map(|slot| {
                    let value = store.resolve(id, slot.clone());
                    (slot, value)
                })
                .collect();
            keyed.sort_by(|a, b| compare(&a.1, &b.1));
            slots.extend(keyed.into_iter().map(|(slot, _)| slot));
        })
    }

    /// Sort the elements by [`Value::total_cmp`].
    pub fn sort(&self) -> Result<()> {
        self.sort_by(Value::total_cmp)
    }

    /// Reverse the elements in place.
    pub fn reverse(&self) -> Result<()> {
        self.store.mutate_array(self.id, "reverse", |slots| slots.reverse())
    }

    fn store_len(&self) -> usize {
        crate::reactive::ReactiveContext::without_tracking(|| self.len())
    }

    fn slot_for(&self, position: usize, input: Input) -> Slot {
        self.store.input_to_slot(self.id, &Key::Index(position), input)
    }

    fn value_of(&self, slot: Option<Slot>) -> Value {
        slot.map_or(Value::Null, |slot| self.store.resolve(self.id, slot))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.store.ptr_eq(&other.store)
    }
}

impl Eq for Node {}

impl ToSnapshot for Node {
    fn to_snapshot(&self) -> Snapshot {
        Node::to_snapshot(self)
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node::new(self.store.clone(), self.id)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.store.unpin(self.id);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.index())
            .field("path", &self.path())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use serde_json::json;

    use crate::error::StoreError;

    fn items(store: &Store) -> Node {
        store.get("items").as_node().cloned().unwrap()
    }

    fn numbers(node: &Node) -> Vec<f64> {
        node.values().iter().filter_map(Value::as_f64).collect()
    }

    #[test]
    fn push_pop_shift_unshift() {
        let store = Store::new(json!({"items": [1, 2]}));
        let list = items(&store);

        assert_eq!(list.push(3).unwrap(), 3);
        assert_eq!(list.unshift(0).unwrap(), 4);
        assert_eq!(numbers(&list), vec![0.0, 1.0, 2.0, 3.0]);

        assert_eq!(list.pop().unwrap(), Value::from(3));
        assert_eq!(list.shift().unwrap(), Value::from(0));
        assert_eq!(numbers(&list), vec![1.0, 2.0]);
    }

    #[test]
    fn splice_removes_and_inserts() {
        let store = Store::new(json!({"items": [1, 2, 3, 4]}));
        let list = items(&store);

        let removed = list.splice(1, 2, [9, 8, 7]).unwrap();
        assert_eq!(removed, vec![Value::from(2), Value::from(3)]);
        assert_eq!(numbers(&list), vec![1.0, 9.0, 8.0, 7.0, 4.0]);

        let removed = list.splice(10, 5, Vec::<i32>::new()).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn sort_and_reverse() {
        let store = Store::new(json!({"items": [3, 1, 2]}));
        let list = items(&store);

        list.sort().unwrap();
        assert_eq!(numbers(&list), vec![1.0, 2.0, 3.0]);

        list.reverse().unwrap();
        assert_eq!(numbers(&list), vec![3.0, 2.0, 1.0]);

        list.sort_by(|a, b| b.total_cmp(a)).unwrap();
        assert_eq!(numbers(&list), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn array_ops_on_objects_fail() {
        let store = Store::new(json!({"obj": {}}));
        let obj = store.get("obj");
        assert_eq!(
            obj.as_node().unwrap().push(1),
            Err(StoreError::NotAnArray {
                op: "push",
                path: "obj".into()
            })
        );
    }

    #[test]
    fn arrays_reject_named_keys() {
        let store = Store::new(json!({"items": []}));
        assert_eq!(
            items(&store).set("name", 1),
            Err(StoreError::invalid_key("name", "items"))
        );
    }

    #[test]
    fn array_mutation_notifies_readers_of_the_array() {
        let store = Store::new(json!({"items": [1]}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe(move |state, _| {
            state.get("items");
            seen.set(seen.get() + 1);
        });

        items(&store).push(2).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn enumeration_tracks_shape() {
        let store = Store::new(json!({"a": 1}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe(move |state, _| {
            state.keys();
            seen.set(seen.get() + 1);
        });

        store.set("a", 2).unwrap();
        assert_eq!(calls.get(), 1);

        store.set("b", 1).unwrap();
        assert_eq!(calls.get(), 2);

        assert!(store.delete("a").unwrap());
        assert_eq!(calls.get(), 3);
        assert_eq!(store.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn missing_key_reader_hears_creation() {
        let store = Store::new(json!({}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe(move |state, _| {
            state.get("later");
            seen.set(seen.get() + 1);
        });

        store.set("later", true).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn deleting_array_element_leaves_a_hole() {
        let store = Store::new(json!({"items": [1, 2]}));
        let list = items(&store);
        assert!(list.delete(0).unwrap());
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Value::Null);
    }
}
