//! Reactive Store
//!
//! A store is a reactive object: every field of every object and array it
//! holds is backed by its own [`Signal`], so readers depend on exactly the
//! fields they touched.
//!
//! # Layout
//!
//! All objects and arrays live in an arena owned by the store and are
//! addressed by [`NodeId`]; the root object is [`NodeId::ROOT`]. A field
//! holding an object stores the child's id, so cycles and shared
//! sub-objects are plain back-references, and reading the same field twice
//! yields the same [`Node`].
//!
//! Each node also has a shape signal, touched whenever keys are added or
//! removed. Enumerating reads (`keys`, `len`, `contains_key`) and reads of
//! missing keys track it.
//!
//! # Notification
//!
//! A write notifies the field's subscribers synchronously. Store
//! subscriptions only mark themselves pending at that point; the write then
//! ends with one delivery pass over pending and global subscriptions. While
//! a batch is open that pass is deferred to the commit (see `batch`).
//!
//! Writes below the root also touch the field holding each ancestor, so a
//! subscription that read `user` hears about `user.name`.
//!
//! # Collection
//!
//! Overwriting or removing a field that held an object, an array or a
//! computed definition may leave nodes nothing refers to. Once the write
//! has been delivered (or the outermost batch has committed) the store
//! marks what is reachable from the root and from live [`Node`] handles
//! and frees the rest. Computed definitions on nodes no longer reachable
//! from the root stop being refreshed.

mod arena;
mod batch;
mod history;
mod node;
mod subscription;
mod value;

pub use node::Node;
pub use subscription::{SubscribeOptions, Subscription};
pub use value::{is_reserved, Input, Key, NodeId, NodeKind, Value, RESERVED_KEYS};

pub(crate) use value::{join_path, Slot};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::config::StoreConfig;
use crate::error::{Result, SnapshotError, StoreError};
use crate::graph::{Composite, Handle, Plain, Snapshot, SnapshotBuilder, ToSnapshot};
use crate::reactive::{Computed, ReactiveContext, SameValue, Signal, Source, Subscriber, SubscriberId};

use arena::Arena;
use batch::{Assignment, BatchStack};
use history::ComputedHistory;
use subscription::{Registry, SubscriptionRecord};

/// Per-key signals of one node.
enum Entries {
    Object(IndexMap<String, Signal<Slot>>),
    Array(Vec<Signal<Slot>>),
}

struct NodeData {
    kind: NodeKind,
    /// Dotted path from the root at creation. Aliases keep the first path.
    path: String,
    /// Where the node was first attached.
    parent: Option<(NodeId, Key)>,
    entries: Entries,
    shape: Signal<u64>,
    /// Reachable from the root as of the last collection.
    attached: bool,
}

impl NodeData {
    fn new(kind: NodeKind, path: String, parent: Option<(NodeId, Key)>) -> Self {
        let entries = match kind {
            NodeKind::Object => Entries::Object(IndexMap::new()),
            NodeKind::Array => Entries::Array(Vec::new()),
        };
        Self {
            kind,
            path,
            parent,
            entries,
            shape: Signal::new(0),
            attached: true,
        }
    }

    fn signal(&self, key: &Key) -> Option<Signal<Slot>> {
        match &self.entries {
            Entries::Object(map) => map.get(&key.as_name()).cloned(),
            Entries::Array(items) => key.as_index().and_then(|i| items.get(i)).cloned(),
        }
    }

    fn names(&self) -> Vec<String> {
        match &self.entries {
            Entries::Object(map) => map.keys().cloned().collect(),
            Entries::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        }
    }

    fn slots(&self) -> Vec<(String, Slot)> {
        match &self.entries {
            Entries::Object(map) => map
                .iter()
                .map(|(name, signal)| (name.clone(), signal.get_untracked()))
                .collect(),
            Entries::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, signal)| (i.to_string(), signal.get_untracked()))
                .collect(),
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            Entries::Object(map) => map.len(),
            Entries::Array(items) => items.len(),
        }
    }

    /// Child nodes with the keys holding them, and computed keys, read
    /// without tracking.
    fn references(&self) -> (Vec<(Key, NodeId)>, Vec<Key>) {
        let mut children = Vec::new();
        let mut computed = Vec::new();
        let mut visit = |key: Key, signal: &Signal<Slot>| match signal.get_untracked() {
            Slot::Node(child) => children.push((key, child)),
            Slot::Computed(_) => computed.push(key),
            _ => {}
        };
        match &self.entries {
            Entries::Object(map) => {
                for (name, signal) in map {
                    visit(Key::Name(name.clone()), signal);
                }
            }
            Entries::Array(items) => {
                for (index, signal) in items.iter().enumerate() {
                    visit(Key::Index(index), signal);
                }
            }
        }
        (children, computed)
    }
}

/// Nodes found by one marking walk.
#[derive(Default)]
struct Reach {
    /// Visit order, breadth first.
    order: Vec<NodeId>,
    /// Computed keys of every visited node.
    computed: HashMap<NodeId, Vec<Key>>,
    /// Every visited `(node, key)` holding a node, in visit order.
    holders: HashMap<NodeId, Vec<(NodeId, Key)>>,
}

impl Reach {
    fn contains(&self, id: NodeId) -> bool {
        self.computed.contains_key(&id)
    }
}

/// Whether overwriting `slot` may leave something to collect.
fn holds_reference(slot: &Slot) -> bool {
    matches!(slot, Slot::Node(_) | Slot::Computed(_))
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    nodes: RefCell<Arena<NodeData>>,
    /// Where computed definitions are installed, in installation order.
    computed: RefCell<IndexSet<(NodeId, Key)>>,
    /// Live [`Node`] handles per node.
    pins: RefCell<HashMap<NodeId, usize>>,
    /// A reference was dropped since the last collection.
    released: Cell<bool>,
    /// State as of the last delivery pass. Kept only while someone listens.
    previous: RefCell<Option<Snapshot>>,
    registry: RefCell<Registry>,
    batches: RefCell<BatchStack>,
    suppressed: Cell<bool>,
    /// A notifying change happened since the last delivery pass.
    changed: Cell<bool>,
    history: RefCell<ComputedHistory>,
}

/// A reactive object.
///
/// Cloning yields another handle to the same store.
///
/// # Example
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use weave_core::store;
///
/// let s = store(serde_json::json!({"count": 0}));
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let sink = log.clone();
/// s.subscribe(move |state, old| {
///     let new = state.get("count").as_f64();
///     let old = old.get("count").and_then(|v| v.as_f64());
///     sink.borrow_mut().push((new, old));
/// });
///
/// s.set("count", 0).unwrap();
/// s.set("count", 1).unwrap();
///
/// assert_eq!(*log.borrow(), vec![(Some(0.0), Some(0.0)), (Some(1.0), Some(0.0))]);
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    /// Create a store from an object.
    ///
    /// A non-object initial value is logged and replaced by an empty
    /// object; use [`Store::try_new`] to get the error instead.
    pub fn new(initial: impl Into<Snapshot>) -> Self {
        Self::with_config(initial, StoreConfig::default())
    }

    /// Create a store with explicit configuration.
    pub fn with_config(initial: impl Into<Snapshot>, config: StoreConfig) -> Self {
        let snapshot = initial.into();
        let store = Self::empty(config);
        match snapshot.expect_object() {
            Ok(_) => store.load(&snapshot),
            Err(err) => tracing::warn!(%err, "starting from an empty object"),
        }
        store
    }

    /// Create a store, failing if `initial` is not an object.
    pub fn try_new(initial: impl Into<Snapshot>) -> std::result::Result<Self, SnapshotError> {
        let snapshot = initial.into();
        snapshot.expect_object()?;
        let store = Self::empty(StoreConfig::default());
        store.load(&snapshot);
        Ok(store)
    }

    fn empty(config: StoreConfig) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                config,
                nodes: RefCell::new(Arena::with_root(NodeData::new(
                    NodeKind::Object,
                    String::new(),
                    None,
                ))),
                computed: RefCell::new(IndexSet::new()),
                pins: RefCell::new(HashMap::new()),
                released: Cell::new(false),
                previous: RefCell::new(None),
                registry: RefCell::new(Registry::default()),
                batches: RefCell::new(BatchStack::default()),
                suppressed: Cell::new(false),
                changed: Cell::new(false),
                history: RefCell::new(ComputedHistory::default()),
            }),
        }
    }

    fn load(&self, snapshot: &Snapshot) {
        let Some(root) = snapshot.root().as_handle() else {
            return;
        };
        let Composite::Object(map) = snapshot.composite(root) else {
            return;
        };

        let mut mapped = HashMap::from([(root, NodeId::ROOT)]);
        for (name, plain) in map {
            if is_reserved(name) {
                tracing::warn!(key = %name, "skipping reserved key in initial state");
                continue;
            }
            let key = Key::Name(name.clone());
            let slot = self.import(snapshot, plain, &mut mapped, NodeId::ROOT, &key);
            self.insert_entry(NodeId::ROOT, &key, slot);
        }
    }

    pub fn root(&self) -> Node {
        self.node(NodeId::ROOT)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Read a top-level field. See [`Node::get`].
    pub fn get(&self, key: impl Into<Key>) -> Value {
        self.root().get(key)
    }

    /// Write a top-level field. See [`Node::set`].
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Input>) -> Result<()> {
        self.root().set(key, value)
    }

    /// Remove a top-level field. See [`Node::delete`].
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        self.root().delete(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.root().keys()
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.root().contains_key(key)
    }

    /// Plain copy of the whole state with computed values resolved.
    pub fn get_state(&self) -> Snapshot {
        self.capture_from(NodeId::ROOT)
    }

    /// The state as JSON. Fails if the state is cyclic.
    pub fn to_json(&self) -> std::result::Result<serde_json::Value, SnapshotError> {
        self.get_state().to_json()
    }

    /// Number of objects and arrays in the arena, the root included.
    ///
    /// Detached nodes count until they are collected, which happens after
    /// the write that detached them unless a [`Node`] handle holds them.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Whether two handles refer to the same store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to changes.
    ///
    /// The callback receives the store and the state before the change. It
    /// runs once immediately as a tracking pass: the fields it reads become
    /// its dependencies. If it reads nothing, it is called on every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Store, &Snapshot) + 'static,
    {
        self.subscribe_with(callback, SubscribeOptions::default())
    }

    /// Subscribe with options.
    pub fn subscribe_with<F>(&self, callback: F, options: SubscribeOptions) -> Subscription
    where
        F: Fn(&Store, &Snapshot) + 'static,
    {
        let id = SubscriberId::new();
        let weak = Rc::downgrade(&self.inner);
        let notify: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.registry.borrow_mut().mark_pending(id);
            }
        });

        let record = Rc::new(SubscriptionRecord::new(
            Subscriber::with_id(id, notify),
            Rc::new(callback),
        ));
        self.inner.registry.borrow_mut().insert(record.clone());
        let current = self.ensure_previous();

        if options.skip_initial_call {
            self.inner.registry.borrow_mut().set_global(id, true);
        } else {
            let dependencies = {
                let ctx = ReactiveContext::enter(record.tracker.clone());
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| (record.callback)(self, &current)));
                if outcome.is_err() {
                    tracing::error!(subscriber = ?id, "subscriber panicked during its tracking pass");
                }
                ctx.take_dependencies()
            };
            let global = dependencies.is_empty();
            record.replace_dependencies(dependencies);
            self.inner.registry.borrow_mut().set_global(id, global);
        }

        tracing::trace!(subscriber = ?id, "subscribed");
        Subscription::new(Rc::downgrade(&self.inner), id)
    }

    fn ensure_previous(&self) -> Snapshot {
        let existing = self.inner.previous.borrow().clone();
        match existing {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = self.get_state();
                *self.inner.previous.borrow_mut() = Some(snapshot.clone());
                snapshot
            }
        }
    }

    /// Deliver to pending and global subscriptions if anything changed.
    pub(crate) fn flush(&self) {
        if self.inner.suppressed.get() || !self.inner.changed.replace(false) {
            return;
        }
        if self.inner.registry.borrow().is_empty() {
            *self.inner.previous.borrow_mut() = None;
            return;
        }

        let old = self.inner.previous.borrow_mut().take();
        let new = self.get_state();
        let old = old.unwrap_or_else(|| new.clone());
        *self.inner.previous.borrow_mut() = Some(new);

        let targets = self.inner.registry.borrow_mut().take_targets();
        for record in targets {
            if record.active.get() {
                self.deliver(&record, &old);
            }
        }
    }

    fn deliver(&self, record: &SubscriptionRecord, old: &Snapshot) {
        let id = record.id();
        let global = self.inner.registry.borrow().is_global(id);
        tracing::trace!(subscriber = ?id, global, "delivering change");

        let outcome = if global {
            // Global subscriptions are re-tracked and become scoped once
            // they read something.
            let ctx = ReactiveContext::enter(record.tracker.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (record.callback)(self, old)));
            let dependencies = ctx.take_dependencies();
            drop(ctx);
            if !dependencies.is_empty() && record.active.get() {
                record.replace_dependencies(dependencies);
                self.inner.registry.borrow_mut().set_global(id, false);
            }
            outcome
        } else {
            let _ctx = ReactiveContext::untracked();
            panic::catch_unwind(AssertUnwindSafe(|| (record.callback)(self, old)))
        };

        if outcome.is_err() {
            tracing::error!(subscriber = ?id, "subscriber panicked; continuing delivery");
        }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Current position in the computed definition history.
    pub fn history_position(&self) -> usize {
        self.inner.history.borrow().position()
    }

    /// Move the history to a new position and return it. Definitions
    /// installed from now on are recorded at the new position.
    pub fn advance_history(&self) -> usize {
        self.inner.history.borrow_mut().advance()
    }

    /// The definition installed at `path` that was active at `position`.
    pub fn computed_definition_at(&self, path: &str, position: usize) -> Option<Computed> {
        self.inner.history.borrow().definition_at(path, position)
    }

    /// Reinstall, for every computed key still present, the definition
    /// that was active at `position`. Runs as one batch.
    pub fn rebind_computed(&self, position: usize) {
        let definitions: Vec<(String, Computed)> = {
            let history = self.inner.history.borrow();
            history
                .paths()
                .into_iter()
                .filter_map(|path| {
                    let definition = history.definition_at(&path, position)?;
                    Some((path, definition))
                })
                .collect()
        };

        self.batch_named("rebind", || {
            for (path, definition) in definitions {
                let Some((id, key)) = self.computed_location(&path) else {
                    continue;
                };
                let current = self.signal_at(id, &key).map(|s| s.get_untracked());
                if let Some(Slot::Computed(current)) = current {
                    if !current.ptr_eq(&definition) && self.put(id, &key, Slot::Computed(definition)) {
                        tracing::debug!(%path, position, "computed definition rebound");
                        self.touch_ancestors(id);
                    }
                }
            }
        });
    }

    /// Replace the data fields with a restored snapshot in one batch.
    ///
    /// Computed keys are left alone; plain keys missing from the snapshot
    /// are removed.
    pub fn replace_state(&self, state: impl Into<Snapshot>) -> std::result::Result<(), SnapshotError> {
        let snapshot = state.into();
        let map = snapshot.expect_object()?;
        let Some(root) = snapshot.root().as_handle() else {
            return Ok(());
        };

        self.batch_named("replace_state", || {
            let mut mapped = HashMap::from([(root, NodeId::ROOT)]);
            for (name, plain) in map {
                if is_reserved(name) {
                    continue;
                }
                let key = Key::Name(name.clone());
                if self.is_computed_slot(NodeId::ROOT, &key) {
                    continue;
                }
                let slot = self.import(&snapshot, plain, &mut mapped, NodeId::ROOT, &key);
                self.put(NodeId::ROOT, &key, slot);
            }

            let stale: Vec<String> = self
                .names_of(NodeId::ROOT)
                .into_iter()
                .filter(|name| !map.contains_key(name))
                .filter(|name| !self.is_computed_slot(NodeId::ROOT, &Key::Name(name.clone())))
                .collect();
            for name in stale {
                self.remove_key(NodeId::ROOT, &name);
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arena access
    // ------------------------------------------------------------------

    pub(crate) fn node(&self, id: NodeId) -> Node {
        Node::new(self.clone(), id)
    }

    pub(crate) fn pin(&self, id: NodeId) {
        if let Ok(mut pins) = self.inner.pins.try_borrow_mut() {
            *pins.entry(id).or_insert(0) += 1;
        }
    }

    pub(crate) fn unpin(&self, id: NodeId) {
        let Ok(mut pins) = self.inner.pins.try_borrow_mut() else {
            return;
        };
        let Some(count) = pins.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        pins.remove(&id);
        // Only a detached node can become collectable here.
        let detached = self
            .inner
            .nodes
            .try_borrow()
            .map_or(true, |nodes| nodes.get(id).is_some_and(|node| !node.attached));
        if detached {
            self.inner.released.set(true);
        }
    }

    pub(crate) fn binding_context(&self, id: NodeId) -> (usize, NodeId) {
        (Rc::as_ptr(&self.inner) as usize, id)
    }

    pub(crate) fn kind_of(&self, id: NodeId) -> NodeKind {
        self.inner
            .nodes
            .borrow()
            .get(id)
            .map_or(NodeKind::Object, |node| node.kind)
    }

    pub(crate) fn path_of(&self, id: NodeId) -> String {
        self.inner
            .nodes
            .borrow()
            .get(id)
            .map(|node| node.path.clone())
            .unwrap_or_default()
    }

    fn parent_of(&self, id: NodeId) -> Option<(NodeId, Key)> {
        self.inner.nodes.borrow().get(id)?.parent.clone()
    }

    fn signal_at(&self, id: NodeId, key: &Key) -> Option<Signal<Slot>> {
        self.inner.nodes.borrow().get(id)?.signal(key)
    }

    fn shape_of(&self, id: NodeId) -> Option<Signal<u64>> {
        self.inner
            .nodes
            .borrow()
            .get(id)
            .map(|node| node.shape.clone())
    }

    fn names_of(&self, id: NodeId) -> Vec<String> {
        self.inner
            .nodes
            .borrow()
            .get(id)
            .map(NodeData::names)
            .unwrap_or_default()
    }

    fn is_computed_slot(&self, id: NodeId, key: &Key) -> bool {
        matches!(
            self.signal_at(id, key).map(|s| s.get_untracked()),
            Some(Slot::Computed(_))
        )
    }

    fn alloc(&self, data: NodeData) -> NodeId {
        self.inner.nodes.borrow_mut().alloc(data)
    }

    fn is_attached(&self, id: NodeId) -> bool {
        self.inner.nodes.borrow().get(id).is_some_and(|node| node.attached)
    }

    /// Store a slot without notifying. Arrays are padded with nulls.
    fn insert_entry(&self, id: NodeId, key: &Key, slot: Slot) {
        let mut nodes = self.inner.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else {
            return;
        };
        match &mut node.entries {
            Entries::Object(map) => {
                map.insert(key.as_name(), Signal::new(slot));
            }
            Entries::Array(items) => {
                let Some(index) = key.as_index() else {
                    return;
                };
                while items.len() < index {
                    items.push(Signal::new(Slot::Null));
                }
                if index < items.len() {
                    items[index] = Signal::new(slot);
                } else {
                    items.push(Signal::new(slot));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub(crate) fn read(&self, id: NodeId, key: &Key) -> Value {
        match self.signal_at(id, key) {
            Some(signal) => {
                let slot = signal.get();
                self.resolve(id, slot)
            }
            None => {
                self.track_shape(id);
                Value::Null
            }
        }
    }

    pub(crate) fn track_shape(&self, id: NodeId) {
        if let Some(shape) = self.shape_of(id) {
            shape.track();
        }
    }

    pub(crate) fn names_tracked(&self, id: NodeId) -> Vec<String> {
        self.track_shape(id);
        self.names_of(id)
    }

    pub(crate) fn len_tracked(&self, id: NodeId) -> usize {
        self.track_shape(id);
        self.inner
            .nodes
            .borrow()
            .get(id)
            .map_or(0, NodeData::len)
    }

    pub(crate) fn contains_tracked(&self, id: NodeId, key: &Key) -> bool {
        self.track_shape(id);
        self.signal_at(id, key).is_some()
    }

    /// Turn a slot owned by node `id` into a value. Computed slots are
    /// evaluated against that node.
    pub(crate) fn resolve(&self, id: NodeId, slot: Slot) -> Value {
        match slot {
            Slot::Null => Value::Null,
            Slot::Bool(b) => Value::Bool(b),
            Slot::Number(n) => Value::Number(n),
            Slot::String(s) => Value::String(s),
            Slot::Node(child) => self.node(child).to_value(),
            Slot::Computed(computed) => computed.get(&self.node(id)),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Normalize a key for node `id`: names for objects, positions for
    /// arrays.
    fn check_key(&self, id: NodeId, key: Key) -> Result<Key> {
        match self.kind_of(id) {
            NodeKind::Object => {
                let name = key.as_name();
                if id == NodeId::ROOT && is_reserved(&name) {
                    return Err(StoreError::ReservedKey { key: name });
                }
                Ok(Key::Name(name))
            }
            NodeKind::Array => key
                .as_index()
                .map(Key::Index)
                .ok_or_else(|| StoreError::invalid_key(&key, self.path_of(id))),
        }
    }

    /// Reject array writes that would pad more than the configured gap.
    fn check_gap(&self, id: NodeId, key: &Key) -> Result<()> {
        let Key::Index(index) = key else {
            return Ok(());
        };
        let len = self.inner.nodes.borrow().get(id).map_or(0, NodeData::len);
        if index.saturating_sub(len) > self.inner.config.max_index_gap {
            return Err(StoreError::invalid_key(index, self.path_of(id)));
        }
        Ok(())
    }

    pub(crate) fn write(&self, id: NodeId, key: Key, input: Input) -> Result<()> {
        let key = self.check_key(id, key)?;
        self.check_gap(id, &key)?;

        let changed = match input {
            Input::Computed(computed) => self.install_computed(id, &key, computed),
            input => {
                let current = self.signal_at(id, &key).map(|s| s.get_untracked());
                if let Some(Slot::Computed(computed)) = current {
                    let slot = self.input_to_slot(id, &key, input);
                    let value = self.resolve(id, slot);
                    let path = join_path(&self.path_of(id), &key);
                    return self.assign_computed(computed, id, value, path);
                }
                let slot = self.input_to_slot(id, &key, input);
                self.put(id, &key, slot)
            }
        };

        if changed {
            self.touch_ancestors(id);
        }
        self.settle();
        Ok(())
    }

    fn assign_computed(&self, computed: Computed, id: NodeId, value: Value, path: String) -> Result<()> {
        if !computed.has_setter() {
            return Err(StoreError::computed_without_setter(path));
        }
        if self.inner.suppressed.get() {
            self.inner.batches.borrow_mut().record_assignment(Assignment {
                computed,
                node: id,
                value,
                path,
            });
            return Ok(());
        }
        computed.assign(&self.node(id), value, &path)
    }

    fn install_computed(&self, id: NodeId, key: &Key, computed: Computed) -> bool {
        let path = join_path(&self.path_of(id), key);
        if self.inner.config.track_history {
            self.inner.history.borrow_mut().record(&path, computed.clone());
        }
        self.inner.computed.borrow_mut().insert((id, key.clone()));
        tracing::debug!(%path, "computed installed");
        self.put(id, key, Slot::Computed(computed))
    }

    pub(crate) fn input_to_slot(&self, id: NodeId, key: &Key, input: Input) -> Slot {
        match input {
            Input::Value(value) => self.value_to_slot(id, key, value),
            Input::Snapshot(snapshot) => {
                let mut mapped = HashMap::new();
                self.import(&snapshot, snapshot.root(), &mut mapped, id, key)
            }
            Input::Computed(computed) => Slot::Computed(computed),
        }
    }

    fn value_to_slot(&self, id: NodeId, key: &Key, value: Value) -> Slot {
        match value {
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(b),
            Value::Number(n) => Slot::Number(n),
            Value::String(s) => Slot::String(s),
            Value::Object(node) | Value::Array(node) => {
                if node.store().ptr_eq(self) {
                    self.adopt(node.id(), id, key);
                    Slot::Node(node.id())
                } else {
                    let snapshot = node.to_snapshot();
                    let mut mapped = HashMap::new();
                    self.import(&snapshot, snapshot.root(), &mut mapped, id, key)
                }
            }
        }
    }

    /// Give a detached node a new home at `(parent, key)`.
    ///
    /// A node that is still attached keeps its first parent. A detached one
    /// takes the new location, and the next collection registers the
    /// computed definitions below it again.
    fn adopt(&self, child: NodeId, parent: NodeId, key: &Key) {
        if child == NodeId::ROOT || self.is_attached(child) {
            return;
        }
        let path = join_path(&self.path_of(parent), key);
        if let Some(node) = self.inner.nodes.borrow_mut().get_mut(child) {
            tracing::trace!(node = child.index(), %path, "detached node adopted");
            node.parent = Some((parent, key.clone()));
            node.path = path;
        }
        self.inner.released.set(true);
    }

    /// Copy a plain value into the arena as fresh nodes attached at
    /// `(parent, key)`. `mapped` preserves sharing and cycles.
    fn import(
        &self,
        snapshot: &Snapshot,
        plain: &Plain,
        mapped: &mut HashMap<Handle, NodeId>,
        parent: NodeId,
        key: &Key,
    ) -> Slot {
        let handle = match plain {
            Plain::Null => return Slot::Null,
            Plain::Bool(b) => return Slot::Bool(*b),
            Plain::Number(n) => return Slot::Number(*n),
            Plain::String(s) => return Slot::String(Rc::from(s.as_str())),
            Plain::Ref(handle) => *handle,
        };
        if let Some(id) = mapped.get(&handle) {
            return Slot::Node(*id);
        }

        let composite = snapshot.composite(handle);
        let kind = match composite {
            Composite::Object(_) => NodeKind::Object,
            Composite::Array(_) => NodeKind::Array,
        };
        let path = join_path(&self.path_of(parent), key);
        let id = self.alloc(NodeData::new(kind, path, Some((parent, key.clone()))));
        mapped.insert(handle, id);

        match composite {
            Composite::Object(map) => {
                for (name, child) in map {
                    let child_key = Key::Name(name.clone());
                    let slot = self.import(snapshot, child, mapped, id, &child_key);
                    self.insert_entry(id, &child_key, slot);
                }
            }
            Composite::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    let child_key = Key::Index(index);
                    let slot = self.import(snapshot, child, mapped, id, &child_key);
                    self.insert_entry(id, &child_key, slot);
                }
            }
        }
        Slot::Node(id)
    }

    /// Write a slot, creating the entry if needed. Returns whether
    /// anything changed.
    fn put(&self, id: NodeId, key: &Key, slot: Slot) -> bool {
        match self.signal_at(id, key) {
            Some(signal) => self.write_signal(&signal, slot),
            None => {
                self.insert_entry(id, key, slot);
                self.bump_shape(id);
                true
            }
        }
    }

    pub(crate) fn write_signal(&self, signal: &Signal<Slot>, slot: Slot) -> bool {
        let before = signal.get_untracked();
        if holds_reference(&before) && !before.same_value(&slot) {
            self.inner.released.set(true);
        }

        if self.inner.suppressed.get() {
            if !signal.set_silent(slot) {
                return false;
            }
            self.inner.batches.borrow_mut().record_write(signal, before);
            // Reads inside the batch must not see stale derivations.
            self.invalidate_all_computed();
            return true;
        }

        let changed = signal.set(slot);
        if changed {
            self.inner.changed.set(true);
        }
        changed
    }

    /// Notify a source's subscribers without a value change.
    fn touch(&self, source: Rc<dyn Source>) {
        if self.inner.suppressed.get() {
            self.inner.batches.borrow_mut().record_touch(source);
        } else {
            source.notify_subscribers();
            self.inner.changed.set(true);
        }
    }

    fn bump_shape(&self, id: NodeId) {
        if let Some(shape) = self.shape_of(id) {
            shape.set_silent(shape.get_untracked().wrapping_add(1));
            self.touch(shape.source());
        }
    }

    /// Touch the field holding each ancestor of `id`, up to the root.
    pub(crate) fn touch_ancestors(&self, id: NodeId) {
        let mut visited = HashSet::from([id]);
        let mut current = id;
        while let Some((parent, key)) = self.parent_of(current) {
            if let Some(signal) = self.signal_holding(parent, &key, current) {
                self.touch(signal.source());
            }
            if !visited.insert(parent) {
                break;
            }
            current = parent;
        }
    }

    /// The signal in `parent` that holds `child`, trying `hint` first.
    /// Array elements may have moved since the child was attached.
    fn signal_holding(&self, parent: NodeId, hint: &Key, child: NodeId) -> Option<Signal<Slot>> {
        let holds = |signal: &Signal<Slot>| matches!(signal.get_untracked(), Slot::Node(id) if id == child);

        let nodes = self.inner.nodes.borrow();
        let node = nodes.get(parent)?;
        if let Some(signal) = node.signal(hint).filter(|s| holds(s)) {
            return Some(signal);
        }
        match &node.entries {
            Entries::Object(map) => map.values().find(|s| holds(s)).cloned(),
            Entries::Array(items) => items.iter().find(|s| holds(s)).cloned(),
        }
    }

    pub(crate) fn delete_at(&self, id: NodeId, key: Key) -> Result<bool> {
        let key = match self.check_key(id, key) {
            Ok(key) => key,
            Err(StoreError::ReservedKey { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let removed = match key {
            // Array elements become holes.
            Key::Index(_) => match self.signal_at(id, &key) {
                Some(signal) => {
                    if self.write_signal(&signal, Slot::Null) {
                        self.touch_ancestors(id);
                    }
                    true
                }
                None => false,
            },
            Key::Name(name) => {
                let removed = self.remove_key(id, &name);
                if removed {
                    self.touch_ancestors(id);
                }
                removed
            }
        };

        self.settle();
        Ok(removed)
    }

    /// Remove an object field and its computed registration.
    fn remove_key(&self, id: NodeId, name: &str) -> bool {
        let removed = {
            let mut nodes = self.inner.nodes.borrow_mut();
            match nodes.get_mut(id).map(|node| &mut node.entries) {
                Some(Entries::Object(map)) => map.shift_remove(name),
                _ => None,
            }
        };
        let Some(signal) = removed else {
            return false;
        };

        let key = Key::Name(name.to_string());
        self.inner.computed.borrow_mut().shift_remove(&(id, key));
        if holds_reference(&signal.get_untracked()) {
            self.inner.released.set(true);
        }
        self.touch(signal.source());
        self.bump_shape(id);
        true
    }

    /// Apply a sequence operation to array node `id` and reconcile the
    /// per-position signals with the result.
    pub(crate) fn mutate_array<R>(
        &self,
        id: NodeId,
        op: &'static str,
        f: impl FnOnce(&mut Vec<Slot>) -> R,
    ) -> Result<R> {
        let signals: Vec<Signal<Slot>> = {
            let nodes = self.inner.nodes.borrow();
            match nodes.get(id).map(|node| &node.entries) {
                Some(Entries::Array(items)) => items.clone(),
                _ => {
                    return Err(StoreError::NotAnArray {
                        op,
                        path: nodes.get(id).map(|n| n.path.clone()).unwrap_or_default(),
                    })
                }
            }
        };

        let mut slots: Vec<Slot> = signals.iter().map(Signal::get_untracked).collect();
        let result = f(&mut slots);

        let mut changed = false;
        for (signal, slot) in signals.iter().zip(&slots) {
            changed |= self.write_signal(signal, slot.clone());
        }

        let (old_len, new_len) = (signals.len(), slots.len());
        if new_len != old_len {
            let removed: Vec<Signal<Slot>> = {
                let mut nodes = self.inner.nodes.borrow_mut();
                match nodes.get_mut(id).map(|node| &mut node.entries) {
                    Some(Entries::Array(items)) if new_len < old_len => items.split_off(new_len),
                    Some(Entries::Array(items)) => {
                        items.extend(slots[old_len..].iter().cloned().map(Signal::new));
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            };
            for signal in removed {
                if holds_reference(&signal.get_untracked()) {
                    self.inner.released.set(true);
                }
                self.touch(signal.source());
            }
            self.bump_shape(id);
            changed = true;
        }

        if changed {
            tracing::trace!(op, node = id.index(), "array mutated");
            self.touch_ancestors(id);
        }
        self.settle();
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Computed bookkeeping
    // ------------------------------------------------------------------

    fn computed_definitions(&self) -> Vec<(NodeId, Computed)> {
        let locations: Vec<(NodeId, Key)> = self.inner.computed.borrow().iter().cloned().collect();
        locations
            .into_iter()
            .filter_map(|(id, key)| match self.signal_at(id, &key)?.get_untracked() {
                Slot::Computed(computed) => Some((id, computed)),
                _ => None,
            })
            .collect()
    }

    /// The installed definition whose dotted path is `path`.
    fn computed_location(&self, path: &str) -> Option<(NodeId, Key)> {
        let locations: Vec<(NodeId, Key)> = self.inner.computed.borrow().iter().cloned().collect();
        locations
            .into_iter()
            .find(|(id, key)| join_path(&self.path_of(*id), key) == path)
    }

    pub(crate) fn invalidate_all_computed(&self) {
        for (_, computed) in self.computed_definitions() {
            computed.invalidate();
        }
    }

    pub(crate) fn refresh_all_computed(&self) {
        for (id, computed) in self.computed_definitions() {
            computed.refresh(&self.node(id));
        }
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Deliver pending changes, then collect what the write released.
    pub(crate) fn settle(&self) {
        self.flush();
        self.collect_garbage();
    }

    /// Free nodes reachable neither from the root nor from a live handle,
    /// and forget computed registrations outside the root's graph.
    pub(crate) fn collect_garbage(&self) {
        if self.inner.suppressed.get() || !self.inner.released.replace(false) {
            return;
        }

        let attached = self.mark_from([NodeId::ROOT]);
        let pinned: Vec<NodeId> = self.inner.pins.borrow().keys().copied().collect();
        let held = self.mark_from(pinned);

        let freed: Vec<NodeData> = {
            let mut nodes = self.inner.nodes.borrow_mut();
            let dead: Vec<NodeId> = nodes
                .ids()
                .filter(|id| !attached.contains(*id) && !held.contains(*id))
                .collect();
            let freed: Vec<NodeData> = dead.iter().filter_map(|id| nodes.free(*id)).collect();

            // Attached nodes whose first parent let go of them take the
            // first holder found from the root. Holders come before the
            // nodes they hold, so their paths are already current.
            for id in attached.order.iter().filter(|id| **id != NodeId::ROOT) {
                let Some(holders) = attached.holders.get(id) else {
                    continue;
                };
                let linked = nodes
                    .get(*id)
                    .and_then(|node| node.parent.as_ref())
                    .is_some_and(|link| holders.contains(link));
                if linked {
                    continue;
                }
                let Some((parent, key)) = holders.first().cloned() else {
                    continue;
                };
                let parent_path = nodes.get(parent).map(|node| node.path.clone()).unwrap_or_default();
                if let Some(node) = nodes.get_mut(*id) {
                    node.path = join_path(&parent_path, &key);
                    node.parent = Some((parent, key));
                }
            }

            // Survivors outside the root's graph are held by handles only.
            // Their writes stop at the last node outside the root's graph.
            let live: Vec<NodeId> = nodes.ids().collect();
            for id in live {
                let in_root_graph = attached.contains(id);
                let parent_in_root_graph = nodes
                    .get(id)
                    .and_then(|node| node.parent.as_ref())
                    .map(|(parent, _)| attached.contains(*parent) || !nodes.contains(*parent));
                if let Some(node) = nodes.get_mut(id) {
                    node.attached = in_root_graph;
                    if !in_root_graph && parent_in_root_graph == Some(true) {
                        node.parent = None;
                    }
                }
            }
            freed
        };

        {
            let mut computed = self.inner.computed.borrow_mut();
            computed.retain(|(id, _)| attached.contains(*id));
            for id in &attached.order {
                for key in attached.computed.get(id).into_iter().flatten() {
                    computed.insert((*id, key.clone()));
                }
            }
        }

        if !freed.is_empty() {
            tracing::trace!(freed = freed.len(), live = self.node_count(), "collected detached nodes");
        }
        // Dropping node data may drop cached values holding handles, which
        // unpin through the store; no arena borrow is held here.
        drop(freed);
    }

    /// Walk the graph from `roots`.
    fn mark_from(&self, roots: impl IntoIterator<Item = NodeId>) -> Reach {
        let nodes = self.inner.nodes.borrow();
        let mut reach = Reach::default();
        let mut queue: std::collections::VecDeque<NodeId> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if reach.computed.contains_key(&id) {
                continue;
            }
            let Some(node) = nodes.get(id) else {
                continue;
            };
            let (children, computed) = node.references();
            reach.computed.insert(id, computed);
            reach.order.push(id);
            for (key, child) in children {
                reach.holders.entry(child).or_default().push((id, key));
                queue.push_back(child);
            }
        }
        reach
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Plain copy of the graph reachable from node `id`.
    pub(crate) fn capture_from(&self, id: NodeId) -> Snapshot {
        let _ctx = ReactiveContext::untracked();
        let mut builder = SnapshotBuilder::new();
        let mut seen = HashMap::new();
        let root = self.capture_node(id, &mut builder, &mut seen);
        builder.finish(root)
    }

    fn capture_node(
        &self,
        id: NodeId,
        builder: &mut SnapshotBuilder,
        seen: &mut HashMap<NodeId, Handle>,
    ) -> Plain {
        if let Some(handle) = seen.get(&id) {
            return Plain::Ref(*handle);
        }

        let (kind, slots) = {
            let nodes = self.inner.nodes.borrow();
            match nodes.get(id) {
                Some(node) => (node.kind, node.slots()),
                None => return Plain::Null,
            }
        };
        let handle = match kind {
            NodeKind::Object => builder.object(),
            NodeKind::Array => builder.array(),
        };
        seen.insert(id, handle);

        for (name, slot) in slots {
            if id == NodeId::ROOT && is_reserved(&name) {
                continue;
            }
            let plain = match slot {
                Slot::Computed(computed) => {
                    let value = computed.get(&self.node(id));
                    self.capture_value(value, builder, seen)
                }
                Slot::Node(child) => self.capture_node(child, builder, seen),
                primitive => self.capture_value(self.resolve(id, primitive), builder, seen),
            };
            match kind {
                NodeKind::Object => builder.insert(handle, name, plain),
                NodeKind::Array => builder.push(handle, plain),
            }
        }
        Plain::Ref(handle)
    }

    fn capture_value(
        &self,
        value: Value,
        builder: &mut SnapshotBuilder,
        seen: &mut HashMap<NodeId, Handle>,
    ) -> Plain {
        match value {
            Value::Null => Plain::Null,
            Value::Bool(b) => Plain::Bool(b),
            Value::Number(n) => Plain::Number(n),
            Value::String(s) => Plain::String(s.to_string()),
            Value::Object(node) | Value::Array(node) => {
                if node.store().ptr_eq(self) {
                    self.capture_node(node.id(), builder, seen)
                } else {
                    builder.embed(&node.to_snapshot())
                }
            }
        }
    }
}

impl ToSnapshot for Store {
    fn to_snapshot(&self) -> Snapshot {
        self.get_state()
    }
}

impl ToSnapshot for Value {
    fn to_snapshot(&self) -> Snapshot {
        match self {
            Value::Null => Snapshot::primitive(Plain::Null),
            Value::Bool(b) => Snapshot::primitive(Plain::Bool(*b)),
            Value::Number(n) => Snapshot::primitive(Plain::Number(*n)),
            Value::String(s) => Snapshot::primitive(Plain::String(s.to_string())),
            Value::Object(node) | Value::Array(node) => node.to_snapshot(),
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("nodes", &self.node_count())
            .field("subscribers", &self.subscriber_count())
            .field("batching", &self.is_batching())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counting(store: &Store, read: &'static [&'static str]) -> Rc<Cell<u32>> {
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe(move |state, _| {
            for key in read {
                state.get(*key);
            }
            seen.set(seen.get() + 1);
        });
        calls
    }

    #[test]
    fn reads_return_stable_node_identity() {
        let store = Store::new(json!({"user": {"name": "a"}}));
        assert_eq!(store.get("user"), store.get("user"));
        assert_eq!(store.get("user").get("name"), Value::from("a"));
    }

    #[test]
    fn same_value_write_does_not_notify() {
        let store = Store::new(json!({"count": 0, "other": 1}));
        let calls = counting(&store, &["count"]);

        store.set("count", 0).unwrap();
        assert_eq!(calls.get(), 1);

        store.set("other", 2).unwrap();
        assert_eq!(calls.get(), 1);

        store.set("count", 1).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn global_subscriber_hears_everything() {
        let store = Store::new(json!({"a": 1}));
        let calls = counting(&store, &[]);

        store.set("a", 2).unwrap();
        store.set("b", 3).unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn skipped_initial_call_starts_global() {
        let store = Store::new(json!({"a": 1}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe_with(
            move |_, _| seen.set(seen.get() + 1),
            SubscribeOptions::skip_initial_call(),
        );

        assert_eq!(calls.get(), 0);
        store.set("a", 2).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn global_subscriber_becomes_scoped_after_reading() {
        let store = Store::new(json!({"a": 1, "b": 1}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe_with(
            move |state, _| {
                state.get("a");
                seen.set(seen.get() + 1);
            },
            SubscribeOptions::skip_initial_call(),
        );

        store.set("b", 2).unwrap();
        assert_eq!(calls.get(), 1);
        // Now scoped to `a`.
        store.set("b", 3).unwrap();
        assert_eq!(calls.get(), 1);
        store.set("a", 2).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn unsubscribe_clears_every_structure() {
        let store = Store::new(json!({"a": 1}));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let subscription = store.subscribe(move |state, _| {
            state.get("a");
            seen.set(seen.get() + 1);
        });

        let signal = store.signal_at(NodeId::ROOT, &Key::from("a")).unwrap();
        assert_eq!(signal.subscriber_count(), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(signal.subscriber_count(), 0);

        store.set("a", 2).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn nested_write_touches_ancestors() {
        let store = Store::new(json!({"user": {"profile": {"name": "a"}}}));
        let calls = counting(&store, &["user"]);

        store
            .get("user")
            .get("profile")
            .as_node()
            .unwrap()
            .set("name", "b")
            .unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn reserved_keys_are_rejected_at_the_root() {
        let store = Store::new(json!({"inner": {}}));
        assert_eq!(
            store.set("batch", 1),
            Err(StoreError::ReservedKey { key: "batch".into() })
        );
        assert_eq!(store.delete("commitBatch"), Ok(false));

        let inner = store.get("inner");
        inner.as_node().unwrap().set("batch", 1).unwrap();
        assert_eq!(inner.get("batch"), Value::from(1));
    }

    #[test]
    fn non_object_initial_state() {
        assert_eq!(
            Store::try_new(json!([1])).unwrap_err(),
            SnapshotError::NotAnObject { found: "an array" }
        );
        assert!(Store::new(json!(3)).keys().is_empty());
    }

    #[test]
    fn get_state_resolves_computed_and_keeps_cycles() {
        let store = Store::new(json!({"a": 2}));
        store
            .set("double", Computed::new(|node: &Node| node.get("a").as_f64().unwrap_or(0.0) * 2.0))
            .unwrap();
        store.set("me", store.root()).unwrap();

        let state = store.get_state();
        assert_eq!(state.get("double"), Some(&Plain::Number(4.0)));
        assert!(state.is_cyclic());
        assert_eq!(state.get("me"), Some(state.root()));
    }

    #[test]
    fn subscriber_panic_does_not_stop_delivery() {
        let store = Store::new(json!({"a": 1}));
        store.subscribe(|state, _| {
            if state.get("a") == Value::from(2) {
                panic!("broken subscriber");
            }
        });
        let calls = counting(&store, &["a"]);

        store.set("a", 2).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn replace_state_restores_plain_keys() {
        let store = Store::new(json!({"a": 1, "stale": true}));
        store
            .set("sum", Computed::new(|node: &Node| node.get("a")))
            .unwrap();
        let calls = counting(&store, &[]);

        store.replace_state(json!({"a": 5, "b": [1]})).unwrap();

        assert_eq!(calls.get(), 2);
        assert_eq!(store.get("sum"), Value::from(5));
        assert!(!store.contains_key("stale"));
        assert_eq!(
            store.to_json().unwrap(),
            json!({"a": 5, "sum": 5, "b": [1]})
        );
    }

    #[test]
    fn history_rebinds_previous_definition() {
        let store = Store::new(json!({"a": 3}));
        let first = Computed::new(|node: &Node| node.get("a"));
        store.set("view", first.clone()).unwrap();

        assert_eq!(store.advance_history(), 1);
        store
            .set("view", Computed::new(|node: &Node| node.get("a").as_f64().unwrap_or(0.0) * 10.0))
            .unwrap();
        assert_eq!(store.get("view"), Value::from(30));

        assert!(store.computed_definition_at("view", 0).unwrap().ptr_eq(&first));
        store.rebind_computed(0);
        assert_eq!(store.get("view"), Value::from(3));
    }

    fn counting_getter(runs: &Rc<Cell<u32>>) -> Computed {
        let seen = runs.clone();
        Computed::new(move |node: &Node| {
            seen.set(seen.get() + 1);
            node.get("name")
        })
    }

    #[test]
    fn replaced_objects_are_collected() {
        let store = Store::new(json!({}));
        for i in 0..10_000 {
            store.set("obj", json!({"x": i})).unwrap();
        }
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.to_json().unwrap(), json!({"obj": {"x": 9999}}));

        store.delete("obj").unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn batched_replacements_are_collected_at_commit() {
        let store = Store::new(json!({"list": []}));
        store.batch(|| {
            for i in 0..100 {
                store.set("obj", json!({"x": i})).unwrap();
            }
        });
        assert_eq!(store.node_count(), 3);
    }

    #[test]
    fn held_handles_survive_detachment() {
        let store = Store::new(json!({"user": {"name": "a"}}));
        let old = store.get("user").as_node().cloned().unwrap();

        store.set("user", json!({"name": "b"})).unwrap();
        assert_eq!(store.node_count(), 3);
        assert_eq!(old.get("name"), Value::from("a"));
        old.set("name", "c").unwrap();
        assert_eq!(old.get("name"), Value::from("c"));
        assert_eq!(store.get("user").get("name"), Value::from("b"));

        drop(old);
        store.set("other", 1).unwrap();
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn detached_computed_values_are_not_refreshed() {
        let store = Store::new(json!({"user": {"name": "a"}, "n": 0}));
        let runs = Rc::new(Cell::new(0));
        store
            .get("user")
            .as_node()
            .unwrap()
            .set("c", counting_getter(&runs))
            .unwrap();
        assert_eq!(store.get("user").get("c"), Value::from("a"));
        assert_eq!(runs.get(), 1);

        store.set("user", json!({"name": "b"})).unwrap();
        for i in 0..100 {
            store.batch(|| store.set("n", i).unwrap());
        }
        assert_eq!(runs.get(), 1);
        assert_eq!(store.get("user").get("c"), Value::Null);
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn reattached_nodes_refresh_their_computed_values() {
        let store = Store::new(json!({"user": {"name": "a"}, "n": 0}));
        let runs = Rc::new(Cell::new(0));
        let user = store.get("user").as_node().cloned().unwrap();
        user.set("c", counting_getter(&runs)).unwrap();
        assert_eq!(user.get("c"), Value::from("a"));

        store.delete("user").unwrap();
        store.batch(|| store.set("n", 1).unwrap());
        assert_eq!(runs.get(), 1);

        store.set("again", user.clone()).unwrap();
        assert_eq!(user.path(), "again");
        store.batch(|| store.set("n", 2).unwrap());
        assert_eq!(runs.get(), 2);
        assert_eq!(store.get("again").get("c"), Value::from("a"));
    }

    #[test]
    fn alias_takes_over_when_the_first_holder_lets_go() {
        let store = Store::new(json!({"user": {"name": "a"}}));
        store.set("alias", store.get("user")).unwrap();
        store.delete("user").unwrap();

        let alias = store.get("alias").as_node().cloned().unwrap();
        assert_eq!(alias.path(), "alias");
        let calls = counting(&store, &["alias"]);
        alias.set("name", "b").unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn far_array_index_is_rejected() {
        let store = Store::with_config(json!({"list": [1]}), StoreConfig::new().with_max_index_gap(4));
        let list = store.get("list").as_node().cloned().unwrap();

        assert_eq!(
            list.set(1_000_000_000usize, 1),
            Err(StoreError::InvalidKey {
                key: "1000000000".into(),
                path: "list".into()
            })
        );
        assert_eq!(list.len(), 1);

        list.set(5usize, 2).unwrap();
        assert_eq!(store.to_json().unwrap(), json!({"list": [1, null, null, null, null, 2]}));
    }

    #[test]
    fn foreign_nodes_are_copied() {
        let a = Store::new(json!({"obj": {"x": 1}}));
        let b = Store::new(json!({}));
        b.set("copy", a.get("obj")).unwrap();

        a.get("obj").as_node().unwrap().set("x", 2).unwrap();
        assert_eq!(b.get("copy").get("x"), Value::from(1));
    }
}
