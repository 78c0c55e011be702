//! Store subscriptions.
//!
//! A subscription is dependency-scoped when its tracking pass read at least
//! one field, and global otherwise. Scoped subscriptions are delivered only
//! when a source they read has notified since the last pass; global ones
//! are delivered on every pass.
//!
//! The registry keeps three structures (records, the global set and the
//! pending set) and removal must clear all of them, plus the subscriber
//! registrations held by the sources themselves.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use super::{Store, StoreInner};
use crate::graph::Snapshot;
use crate::reactive::{Dependencies, Subscriber, SubscriberId};

/// Subscriber callback: the store (reads are tracked during tracking
/// passes) and the state before the change.
pub(crate) type Callback = Rc<dyn Fn(&Store, &Snapshot)>;

/// Options for [`Store::subscribe_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Do not run the initial tracking pass. The subscription starts global.
    pub skip_initial_call: bool,
}

impl SubscribeOptions {
    pub fn skip_initial_call() -> Self {
        Self {
            skip_initial_call: true,
        }
    }
}

pub(crate) struct SubscriptionRecord {
    pub(crate) callback: Callback,
    pub(crate) tracker: Subscriber,
    pub(crate) dependencies: RefCell<Dependencies>,
    pub(crate) active: Cell<bool>,
}

impl SubscriptionRecord {
    pub(crate) fn new(tracker: Subscriber, callback: Callback) -> Self {
        Self {
            callback,
            tracker,
            dependencies: RefCell::new(Dependencies::new()),
            active: Cell::new(true),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.tracker.id()
    }

    /// Replace the dependency set, detaching from sources no longer read.
    pub(crate) fn replace_dependencies(&self, dependencies: Dependencies) {
        let previous = std::mem::replace(&mut *self.dependencies.borrow_mut(), dependencies);
        let current = self.dependencies.borrow();
        for dependency in previous.iter() {
            if !current.iter().any(|d| d.id() == dependency.id()) {
                dependency.detach(self.id());
            }
        }
    }

    fn detach_all(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.borrow_mut());
        for dependency in &dependencies {
            dependency.detach(self.id());
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    records: IndexMap<SubscriberId, Rc<SubscriptionRecord>>,
    global: IndexSet<SubscriberId>,
    pending: IndexSet<SubscriberId>,
}

impl Registry {
    pub(crate) fn insert(&mut self, record: Rc<SubscriptionRecord>) {
        self.records.insert(record.id(), record);
    }

    pub(crate) fn get(&self, id: SubscriberId) -> Option<Rc<SubscriptionRecord>> {
        self.records.get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn set_global(&mut self, id: SubscriberId, global: bool) {
        if global {
            self.global.insert(id);
        } else {
            self.global.shift_remove(&id);
        }
    }

    pub(crate) fn is_global(&self, id: SubscriberId) -> bool {
        self.global.contains(&id)
    }

    /// Called from a subscription's tracker when a source it read changed.
    pub(crate) fn mark_pending(&mut self, id: SubscriberId) {
        if self.records.contains_key(&id) {
            self.pending.insert(id);
        }
    }

    /// Drain the pending set and return everyone to deliver, in
    /// registration order.
    pub(crate) fn take_targets(&mut self) -> Vec<Rc<SubscriptionRecord>> {
        let pending = std::mem::take(&mut self.pending);
        self.records
            .iter()
            .filter(|(id, _)| pending.contains(*id) || self.global.contains(*id))
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn remove(&mut self, id: SubscriberId) -> Option<Rc<SubscriptionRecord>> {
        self.global.shift_remove(&id);
        self.pending.shift_remove(&id);
        self.records.shift_remove(&id)
    }
}

/// Handle returned by [`Store::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to end it.
pub struct Subscription {
    store: Weak<StoreInner>,
    id: SubscriberId,
}

impl Subscription {
    pub(crate) fn new(store: Weak<StoreInner>, id: SubscriberId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the subscription is still registered.
    pub fn is_active(&self) -> bool {
        self.store
            .upgrade()
            .is_some_and(|inner| inner.registry.borrow().get(self.id).is_some())
    }

    /// Stop delivering to this subscription. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };

        let removed = {
            let mut registry = inner.registry.borrow_mut();
            let removed = registry.remove(self.id);
            if registry.is_empty() {
                *inner.previous.borrow_mut() = None;
            }
            removed
        };

        if let Some(record) = removed {
            record.active.set(false);
            record.detach_all();
            tracing::trace!(subscriber = ?self.id, "unsubscribed");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
