//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, the tracking
//! context, and computed values. These primitives form the foundation of
//! the store's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed value or a subscription's
//! tracking pass), the signal automatically registers that context as a
//! dependent. When the signal's value changes, all dependents are notified.
//!
//! ## Computed Values
//!
//! A Computed is a derived value that caches its result. It re-evaluates
//! only when one of its dependencies changes, and only when it is next
//! read. Computed definitions are installed under store keys and receive
//! the node they are installed on.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to detect
//! dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, register the dependency.
//!
//! Everything here is single-threaded (`Rc`, `RefCell`). Notification is
//! synchronous and re-entrant: a subscriber may read or write signals while
//! it is being notified.

mod computed;
mod context;
mod signal;
mod subscriber;

pub use computed::Computed;
pub use context::ReactiveContext;
pub use signal::{SameValue, Signal};
pub use subscriber::{Dependency, SourceId, Subscriber, SubscriberId};

pub(crate) use context::Dependencies;
pub(crate) use subscriber::Source;
