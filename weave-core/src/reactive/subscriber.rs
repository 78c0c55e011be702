//! Subscriber types for the reactive system.
//!
//! A Subscriber is anything that wants to hear about a change in a reactive
//! source: a computed value marking itself dirty, or a store subscription
//! marking itself pending for the next notification pass.
//!
//! Sources (signals and computed values) keep a map of subscribers. The
//! subscribing side keeps a list of [`Dependency`] entries pointing back at
//! the sources it read, so it can detach itself from all of them at once.

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
///
/// Each subscriber (computed value, store subscription, or tracking pass)
/// gets a unique ID when created. Sources key their subscriber maps by this
/// ID, which makes re-registration idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a reactive source (a signal or a computed value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Generate a new unique source ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber to a reactive source.
///
/// The notification callback takes no arguments; it only records that
/// something this subscriber read has changed. Deciding what to do about it
/// (recompute, re-run, defer) is up to whoever installed the callback.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    notify: Rc<dyn Fn()>,
}

impl Subscriber {
    /// Create a new subscriber with a fresh ID and the given callback.
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn() + 'static,
    {
        Self::with_id(SubscriberId::new(), Rc::new(notify))
    }

    /// Create a subscriber for an existing ID.
    pub fn with_id(id: SubscriberId, notify: Rc<dyn Fn()>) -> Self {
        Self { id, notify }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Notify the subscriber that one of its dependencies changed.
    pub fn notify(&self) {
        (self.notify)();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// Behaviour shared by everything that can be depended upon.
pub(crate) trait Source {
    /// The source's unique ID.
    fn source_id(&self) -> SourceId;

    /// Register a subscriber. Re-registering the same ID replaces the entry.
    fn add_subscriber(&self, subscriber: Subscriber);

    /// Detach a subscriber.
    fn remove_subscriber(&self, id: SubscriberId);

    /// Invoke every subscriber callback without changing the value.
    fn notify_subscribers(&self);
}

/// A recorded read of a source.
///
/// Holds the source weakly: a dependency must not keep a deleted key's
/// signal alive on its own.
#[derive(Clone)]
pub struct Dependency {
    id: SourceId,
    source: Weak<dyn Source>,
}

impl Dependency {
    pub(crate) fn new(id: SourceId, source: Weak<dyn Source>) -> Self {
        Self { id, source }
    }

    /// ID of the source that was read.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Remove `subscriber` from the source, if the source still exists.
    pub fn detach(&self, subscriber: SubscriberId) {
        if let Some(source) = self.source.upgrade() {
            source.remove_subscriber(subscriber);
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dependency").field(&self.id).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn subscriber_notify_calls_callback() {
        let called = Rc::new(Cell::new(false));
        let called_clone = called.clone();

        let subscriber = Subscriber::new(move || called_clone.set(true));

        assert!(!called.get());
        subscriber.notify();
        assert!(called.get());
    }

    #[test]
    fn cloned_subscriber_keeps_identity() {
        let subscriber = Subscriber::new(|| {});
        let clone = subscriber.clone();
        assert_eq!(subscriber.id(), clone.id());
    }
}
