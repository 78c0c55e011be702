//! Reactive Context
//!
//! The reactive context tracks which computation is currently recording
//! reads. When a signal is read, it registers the current computation as a
//! subscriber and the computation records the signal as a dependency.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a context pushes an entry and the
//! returned guard pops it on drop, so the previous context is restored even
//! if the computation panics. An entry may also be *untracked*: reads made
//! while an untracked entry is on top are attributed to nobody, even if a
//! tracking entry sits further down the stack.
//!
//! This push/pop discipline is what attributes reads inside a nested
//! computed evaluation to the innermost computation, not the outermost.

use std::cell::RefCell;

use smallvec::SmallVec;

use super::subscriber::{Dependency, SourceId, Subscriber, SubscriberId};

/// Inline capacity for recorded dependencies. Most derivations read a
/// handful of fields.
pub(crate) type Dependencies = SmallVec<[Dependency; 4]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<ContextEntry>>> = const { RefCell::new(Vec::new()) };
}

/// An active tracking entry.
struct ContextEntry {
    /// Who gets registered on every source read.
    subscriber: Subscriber,
    /// Sources read so far, deduplicated by ID.
    dependencies: Dependencies,
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    subscriber_id: Option<SubscriberId>,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given subscriber.
    ///
    /// While this context is on top of the stack, every source that is read
    /// registers `subscriber` and is recorded as a dependency.
    pub fn enter(subscriber: Subscriber) -> Self {
        let subscriber_id = subscriber.id();
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(Some(ContextEntry {
                subscriber,
                dependencies: Dependencies::new(),
            }));
        });

        Self {
            subscriber_id: Some(subscriber_id),
        }
    }

    /// Enter an untracked region. Reads inside it are not recorded anywhere.
    pub fn untracked() -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(None));
        Self { subscriber_id: None }
    }

    /// Run `f` without recording any reads.
    pub fn without_tracking<R>(f: impl FnOnce() -> R) -> R {
        let _ctx = Self::untracked();
        f()
    }

    /// Check if reads are currently being recorded.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
    }

    /// Get the current subscriber ID, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.as_ref())
                .map(|entry| entry.subscriber.id())
        })
    }

    /// Get the current subscriber, if any.
    pub fn current() -> Option<Subscriber> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.as_ref())
                .map(|entry| entry.subscriber.clone())
        })
    }

    /// Record a dependency in the current context.
    ///
    /// Called by sources when they are read. Repeated reads of the same
    /// source are recorded once.
    pub fn track_dependency(dependency: Dependency) {
        CONTEXT_STACK.with(|stack| {
            if let Some(Some(entry)) = stack.borrow_mut().last_mut() {
                if !entry.dependencies.iter().any(|d| d.id() == dependency.id()) {
                    entry.dependencies.push(dependency);
                }
            }
        });
    }

    /// IDs of the dependencies collected so far in the current context.
    pub fn dependency_ids() -> Vec<SourceId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.as_ref())
                .map(|entry| entry.dependencies.iter().map(Dependency::id).collect())
                .unwrap_or_default()
        })
    }

    /// Move the dependencies collected by this context out of it.
    ///
    /// Must be called on the guard that is currently on top of the stack.
    pub(crate) fn take_dependencies(&self) -> Dependencies {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(Some(entry)) if Some(entry.subscriber.id()) == self.subscriber_id => {
                    std::mem::take(&mut entry.dependencies)
                }
                _ => Dependencies::new(),
            }
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.as_ref().map(|e| e.subscriber.id()),
                    self.subscriber_id,
                    "ReactiveContext mismatch"
                );
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
