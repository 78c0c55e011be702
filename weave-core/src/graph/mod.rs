//! Snapshot Graph
//!
//! This module implements the plain side of the crate: snapshots of store
//! state and the structural diff between two of them.
//!
//! # Overview
//!
//! A snapshot is an arena of objects and arrays addressed by [`Handle`]:
//!
//! - Primitives are stored inline
//! - Composites are referenced by handle, so cycles and shared sub-objects
//!   are ordinary back-references
//!
//! Nothing here is reactive. Snapshots are produced by the store (see
//! [`crate::store::Store::get_state`]) or built from JSON, and diffing is a
//! pure function over two of them.
//!
//! # Design Decisions
//!
//! 1. Cycle bookkeeping is a set of visited handle pairs rather than object
//!    identity maps, since handles are plain integers.
//!
//! 2. Equality and diffing keep separate visited sets. Equality treats a
//!    revisited pair as equal; the diff builder reports a pair that is still
//!    being expanded as circular.

mod diff;
mod snapshot;

pub use diff::{deep_equal, diff_snapshots, Diff, DiffNode};
pub use snapshot::{Composite, Handle, Plain, Snapshot, SnapshotBuilder, ToSnapshot};
