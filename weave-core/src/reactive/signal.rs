//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context, the signal registers
//!    that context's subscriber and the context records the signal as a
//!    dependency.
//!
//! 2. When a signal is written with a value that is not identity-equal to
//!    the current one, every subscriber callback is invoked.
//!
//! 3. Writes with an identity-equal value are no-ops and report "no change".
//!
//! Subscriber callbacks are invoked over a point-in-time copy of the
//! subscriber map, so callbacks may subscribe or unsubscribe freely.
//!
//! # Threading
//!
//! Signals are single-threaded (`Rc` + `RefCell`). The only hazard is
//! re-entrancy, and no borrow is held while user callbacks run.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::context::ReactiveContext;
use super::subscriber::{Dependency, Source, SourceId, Subscriber, SubscriberId};

/// Identity equality used to decide whether a write is a change.
///
/// This is the `SameValue` relation: for floats `NaN` equals `NaN`, but
/// `+0.0` and `-0.0` are distinct.
pub trait SameValue {
    /// Returns true if `self` and `other` are the same value.
    fn same_value(&self, other: &Self) -> bool;
}

impl SameValue for f64 {
    fn same_value(&self, other: &Self) -> bool {
        if self.is_nan() && other.is_nan() {
            return true;
        }
        self.to_bits() == other.to_bits()
    }
}

macro_rules! same_value_by_eq {
    ($($ty:ty),*) => {
        $(impl SameValue for $ty {
            fn same_value(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

same_value_by_eq!(bool, u64, i64, usize, String, ());

impl SameValue for Rc<str> {
    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: SameValue> SameValue for Option<T> {
    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_value(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// A reactive signal holding a value of type `T`.
///
/// Cloning a signal yields another handle to the same cell.
///
/// # Example
///
/// ```rust
/// use weave_core::reactive::Signal;
///
/// let count = Signal::new(0.0);
/// assert!(count.set(5.0));
/// assert!(!count.set(5.0));
/// assert_eq!(count.get(), 5.0);
/// ```
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

struct SignalInner<T> {
    /// Unique identifier for this signal.
    id: SourceId,

    /// The current value.
    value: RefCell<T>,

    /// Subscribers keyed by ID, in registration order.
    subscribers: RefCell<IndexMap<SubscriberId, Subscriber>>,
}

impl<T: 'static> Source for SignalInner<T> {
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
        let subscribers: Vec<Subscriber> = self.subscribers.borrow().values().cloned().collect();
        for subscriber in subscribers {
            subscriber.notify();
        }
    }
}

impl<T> Signal<T>
where
    T: Clone + SameValue + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(SignalInner {
                id: SourceId::new(),
                value: RefCell::new(value),
                subscribers: RefCell::new(IndexMap::new()),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the
    /// current computation as a subscriber.
    pub fn get(&self) -> T {
        self.track();
        self.get_untracked()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Register the current reactive context, if any, without reading.
    pub fn track(&self) {
        if let Some(subscriber) = ReactiveContext::current() {
            self.inner.add_subscriber(subscriber);
            ReactiveContext::track_dependency(self.dependency());
        }
    }

    /// Set a new value and notify subscribers.
    ///
    /// Returns `false` without notifying if `value` is identity-equal to
    /// the current value.
    pub fn set(&self, value: T) -> bool {
        if !self.set_silent(value) {
            return false;
        }
        tracing::trace!(signal = self.inner.id.raw(), "signal written");
        self.notify();
        true
    }

    /// Store a new value without notifying anyone.
    ///
    /// Used while notifications are deferred: reads see the fresh value but
    /// subscribers hear about it later. Returns whether the value changed.
    pub fn set_silent(&self, value: T) -> bool {
        let mut current = self.inner.value.borrow_mut();
        if current.same_value(&value) {
            return false;
        }
        *current = value;
        true
    }

    /// Update the value using a function.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = f(&self.inner.value.borrow());
        self.set(new_value)
    }

    /// Invoke every subscriber callback without changing the value.
    pub fn notify(&self) {
        self.inner.notify_subscribers();
    }

    /// Register a notification callback for a subscriber.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.inner.add_subscriber(subscriber);
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        self.inner.remove_subscriber(subscriber_id);
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// A dependency record pointing at this signal.
    pub fn dependency(&self) -> Dependency {
        let weak: Weak<dyn Source> = Rc::downgrade(&self.inner) as Weak<dyn Source>;
        Dependency::new(self.inner.id, weak)
    }

    /// This signal as a type-erased source.
    pub(crate) fn source(&self) -> Rc<dyn Source> {
        self.inner.clone()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.inner.value.borrow())
            .field("subscriber_count", &self.inner.subscribers.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
