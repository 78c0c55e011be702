//! Weave Core
//!
//! This crate provides a fine-grained reactive state container. It
//! implements:
//!
//! - Reactive primitives (signals, tracking context, computed values)
//! - A reactive object store with per-field subscriptions
//! - Batching with exactly-once notification
//! - Plain snapshots and a cycle-safe structural diff
//!
//! Everything is single-threaded and synchronous. Stores are `!Send`.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Signals, dependency tracking and computed values
//! - `store`: The reactive object, its nodes, subscriptions and batches
//! - `graph`: Plain snapshots and the structural diff
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use serde_json::json;
//! use weave_core::{computed, diff, json, store, Value};
//!
//! let s = store(json!({"a": 1, "b": 2}));
//! s.set("sum", computed(|node| {
//!     let a = node.get("a").as_f64().unwrap_or(0.0);
//!     let b = node.get("b").as_f64().unwrap_or(0.0);
//!     a + b
//! })).unwrap();
//!
//! let runs = Rc::new(Cell::new(0));
//! let seen = runs.clone();
//! s.subscribe(move |state, _| {
//!     state.get("sum");
//!     seen.set(seen.get() + 1);
//! });
//!
//! let before = json(&s);
//! s.batch(|| {
//!     s.set("a", 10).unwrap();
//!     s.set("b", 20).unwrap();
//! });
//!
//! assert_eq!(s.get("sum"), Value::from(30));
//! assert_eq!(runs.get(), 2);
//! assert_eq!(
//!     serde_json::to_value(diff(&before, &s)).unwrap(),
//!     json!({
//!         "a": {"__old": 1, "__new": 10},
//!         "b": {"__old": 2, "__new": 20},
//!         "sum": {"__old": 3, "__new": 30}
//!     })
//! );
//! ```

pub mod graph;
pub mod reactive;
pub mod store;

mod config;
mod error;

pub use config::{StoreConfig, DEFAULT_MAX_COMMIT_ROUNDS, DEFAULT_MAX_RECOMPUTE_ITERATIONS};
pub use error::{Result, SnapshotError, StoreError};
pub use graph::{Diff, DiffNode, Snapshot, ToSnapshot};
pub use reactive::Computed;
pub use store::{Input, Key, Node, NodeId, NodeKind, Store, SubscribeOptions, Subscription, Value};

/// Create a store from an object.
///
/// Accepts a [`Snapshot`] or anything convertible to one, such as a
/// `serde_json::Value`. See [`Store::new`].
pub fn store(initial: impl Into<Snapshot>) -> Store {
    Store::new(initial)
}

/// Create a computed definition. See [`Computed::new`].
pub fn computed<F, R>(getter: F) -> Computed
where
    F: Fn(&Node) -> R + 'static,
    R: Into<Value>,
{
    Computed::new(getter)
}

/// Plain snapshot of a store, node, value or snapshot, with computed
/// values resolved and cycles preserved.
pub fn json<T: ToSnapshot + ?Sized>(source: &T) -> Snapshot {
    source.to_snapshot()
}

/// Structural diff from `a` to `b`. See [`graph::diff_snapshots`].
pub fn diff<A, B>(a: &A, b: &B) -> Diff
where
    A: ToSnapshot + ?Sized,
    B: ToSnapshot + ?Sized,
{
    graph::diff_snapshots(&a.to_snapshot(), &b.to_snapshot())
}
