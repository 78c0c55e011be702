//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when one of
//! the sources it read has changed.
//!
//! # How Computed Values Work
//!
//! 1. On first access, the getter runs inside a reactive context owned by
//!    the computed value and the result is cached.
//!
//! 2. Every source read during that run registers the computed value's
//!    "mark dirty" callback.
//!
//! 3. When one of those sources changes, the value is marked dirty and the
//!    change is forwarded to whoever read the computed value.
//!
//! 4. The next access recomputes. Accesses in between return the cache.
//!
//! A computed value is therefore both a subscriber (to its sources) and a
//! source (to its readers).
//!
//! # Self-dirtying getters
//!
//! A getter may write to a field it reads. The recompute runs in a bounded
//! loop: the dirty flag is cleared before each run, and if the run dirtied
//! the value again it runs once more, up to
//! [`StoreConfig::max_recompute_iterations`](crate::StoreConfig). At the cap
//! a warning is logged and the last result is kept.
//!
//! # Binding
//!
//! The getter receives the node the definition is installed on. Moving the
//! same definition to a different node marks it dirty.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::context::{Dependencies, ReactiveContext};
use super::signal::SameValue;
use super::subscriber::{Dependency, Source, SourceId, Subscriber, SubscriberId};
use crate::error::{Result, StoreError};
use crate::store::{Node, NodeId, Value};

type Getter = Rc<dyn Fn(&Node) -> Value>;
type Setter = Rc<dyn Fn(&Node, Value)>;

/// Identity of the node a computed value was last evaluated against.
type BindingContext = (usize, NodeId);

/// A memoized derivation that can be installed under any store key.
///
/// Cloning yields another handle to the same definition; the cache and the
/// dirty flag are shared.
///
/// # Example
///
/// ```rust
/// use weave_core::{computed, store, Value};
///
/// let s = store(serde_json::json!({"a": 1, "b": 2}));
/// s.set("sum", computed(|node| {
///     let a = node.get("a").as_f64().unwrap_or(0.0);
///     let b = node.get("b").as_f64().unwrap_or(0.0);
///     Value::from(a + b)
/// })).unwrap();
///
/// assert_eq!(s.get("sum"), Value::from(3));
/// s.set("a", 10).unwrap();
/// assert_eq!(s.get("sum"), Value::from(12));
/// ```
#[derive(Clone)]
pub struct Computed {
    inner: Rc<ComputedInner>,
}

struct ComputedInner {
    /// Source identity seen by readers.
    id: SourceId,

    /// Tracking subscriber registered on every source the getter reads.
    tracker: Subscriber,

    getter: Getter,
    setter: RefCell<Option<Setter>>,

    /// The cached result (None if never computed).
    cached: RefCell<Option<Value>>,

    dirty: Cell<bool>,
    computing: Cell<bool>,
    notifying: Cell<bool>,

    /// Readers of this computed value.
    subscribers: RefCell<IndexMap<SubscriberId, Subscriber>>,

    /// Sources read during the last recompute.
    sources: RefCell<Dependencies>,

    last_context: Cell<Option<BindingContext>>,
    max_iterations: Cell<Option<usize>>,
}

impl Source for ComputedInner {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn add_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.borrow_mut().insert(subscriber.id(), subscriber);
    }

    fn remove_subscriber(&self, id: SubscriberId) {
        self.subscribers.borrow_mut().shift_remove(&id);
    }

    fn notify_subscribers(&self) {
        // A cycle of computed values notifying each other stops here.
        if self.notifying.replace(true) {
            return;
        }
        let subscribers: Vec<Subscriber> = self.subscribers.borrow().values().cloned().collect();
        for subscriber in subscribers {
            subscriber.notify();
        }
        self.notifying.set(false);
    }
}

impl ComputedInner {
    fn mark_dirty(&self) {
        self.dirty.set(true);
        self.notify_subscribers();
    }
}

/// Resets the computing flag even if the getter panics past the boundary.
struct ComputingGuard<'a>(&'a Cell<bool>);

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Computed {
    /// Create a computed definition from a getter.
    ///
    /// The getter is not run until the value is first read.
    pub fn new<F, R>(getter: F) -> Self
    where
        F: Fn(&Node) -> R + 'static,
        R: Into<Value>,
    {
        let getter: Getter = Rc::new(move |node: &Node| getter(node).into());
        let inner = Rc::new_cyclic(|weak: &Weak<ComputedInner>| {
            let weak = weak.clone();
            let notify: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.mark_dirty();
                }
            });

            ComputedInner {
                id: SourceId::new(),
                tracker: Subscriber::with_id(SubscriberId::new(), notify),
                getter,
                setter: RefCell::new(None),
                cached: RefCell::new(None),
                dirty: Cell::new(true),
                computing: Cell::new(false),
                notifying: Cell::new(false),
                subscribers: RefCell::new(IndexMap::new()),
                sources: RefCell::new(Dependencies::new()),
                last_context: Cell::new(None),
                max_iterations: Cell::new(None),
            }
        });

        Self { inner }
    }

    /// Attach a setter, making this a settable computed property.
    ///
    /// Assigning a plain value to the key the definition is installed under
    /// calls the setter instead of replacing the definition.
    pub fn with_setter<F, V>(self, setter: F) -> Self
    where
        F: Fn(&Node, V) + 'static,
        V: From<Value>,
    {
        let setter: Setter = Rc::new(move |node: &Node, value: Value| setter(node, V::from(value)));
        *self.inner.setter.borrow_mut() = Some(setter);
        self
    }

    /// Override the store's recompute cap for this definition.
    pub fn with_max_iterations(self, iterations: usize) -> Self {
        self.inner.max_iterations.set(Some(iterations.max(1)));
        self
    }

    /// Source ID seen by readers of this value.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the value for `node`, recomputing if necessary.
    ///
    /// If called within a reactive context, the current computation is
    /// registered as a reader of this value.
    pub fn get(&self, node: &Node) -> Value {
        self.track();

        let context = node.binding_context();
        if self.inner.last_context.get() != Some(context) {
            self.inner.last_context.set(Some(context));
            self.inner.dirty.set(true);
        }

        // A read of this value from inside its own getter sees the cache.
        if self.inner.computing.get() || !self.inner.dirty.get() {
            return self.cached();
        }

        self.recompute(node)
    }

    /// Whether the next access will recompute.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    /// Whether the value has been computed at least once.
    pub fn has_value(&self) -> bool {
        self.inner.cached.borrow().is_some()
    }

    /// Whether a setter is attached.
    pub fn has_setter(&self) -> bool {
        self.inner.setter.borrow().is_some()
    }

    /// Mark the value dirty and tell its readers.
    pub fn mark_dirty(&self) {
        self.inner.mark_dirty();
    }

    /// Mark the value dirty without telling anyone.
    pub(crate) fn invalidate(&self) {
        self.inner.dirty.set(true);
    }

    /// Recompute eagerly and tell readers if the result changed.
    ///
    /// Returns whether the result changed.
    pub(crate) fn refresh(&self, node: &Node) -> bool {
        let before = self.inner.cached.borrow().clone();
        self.invalidate();
        let after = ReactiveContext::without_tracking(|| self.get(node));

        let changed = !matches!(&before, Some(value) if value.same_value(&after));
        if changed {
            self.inner.notify_subscribers();
        }
        changed
    }

    /// Route an assignment through the setter.
    ///
    /// `path` names the key for the error raised when there is no setter.
    pub(crate) fn assign(&self, node: &Node, value: Value, path: &str) -> Result<()> {
        let setter = self.inner.setter.borrow().clone();
        match setter {
            Some(setter) => {
                setter(node, value);
                Ok(())
            }
            None => Err(StoreError::computed_without_setter(path)),
        }
    }

    /// Whether two handles refer to the same definition.
    pub fn ptr_eq(&self, other: &Computed) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of readers currently registered.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Number of sources read during the last recompute.
    pub fn dependency_count(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    fn cached(&self) -> Value {
        self.inner.cached.borrow().clone().unwrap_or(Value::Null)
    }

    fn track(&self) {
        if let Some(subscriber) = ReactiveContext::current() {
            self.inner.add_subscriber(subscriber);
            let weak: Weak<dyn Source> = Rc::downgrade(&self.inner) as Weak<dyn Source>;
            ReactiveContext::track_dependency(Dependency::new(self.inner.id, weak));
        }
    }

    fn recompute(&self, node: &Node) -> Value {
        let cap = self
            .inner
            .max_iterations
            .get()
            .unwrap_or_else(|| node.store().config().max_recompute_iterations)
            .max(1);

        self.inner.computing.set(true);
        let _guard = ComputingGuard(&self.inner.computing);

        let mut iterations = 0;
        loop {
            iterations += 1;
            self.inner.dirty.set(false);

            // The dependency set is rebuilt from scratch on every run.
            let previous = std::mem::take(&mut *self.inner.sources.borrow_mut());
            for dependency in &previous {
                dependency.detach(self.inner.tracker.id());
            }

            let ctx = ReactiveContext::enter(self.inner.tracker.clone());
            let getter = self.inner.getter.clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| getter(node)));
            let dependencies = ctx.take_dependencies();
            drop(ctx);

            *self.inner.sources.borrow_mut() = dependencies;

            match outcome {
                Ok(value) => *self.inner.cached.borrow_mut() = Some(value),
                Err(_) => tracing::error!(
                    path = %node.path(),
                    "computed getter panicked; keeping the previous value"
                ),
            }

            if !self.inner.dirty.get() {
                break;
            }
            if iterations >= cap {
                tracing::warn!(
                    iterations,
                    path = %node.path(),
                    "computed value is still dirty after the recompute cap; returning the last result"
                );
                self.inner.dirty.set(false);
                break;
            }
        }

        self.cached()
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .field("has_setter", &self.has_setter())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
