//! Batch Coordinator
//!
//! While a batch is open, writes update the live signals silently so reads
//! inside the batch see fresh values, and the top frame records what was
//! written. Frames nest: committing an inner frame merges it into its
//! parent. Committing the outermost frame runs, in order:
//!
//! 1. notification of every plain-field write whose value really changed
//! 2. settable-computed setters, so they observe updated siblings
//! 3. eager re-evaluation of every computed value
//! 4. one notification pass for the whole batch
//!
//! A frame that recorded nothing has nothing to re-evaluate, so an empty
//! batch skips step 3. Computed values are then exactly as fresh as they
//! were before the batch opened.
//!
//! A batch whose closure panics or returns `Err` is unwound by
//! [`BatchGuard`]: frames above the starting depth are removed and the
//! saved suppression flag is restored, so a failure never leaves the store
//! silent.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;

use super::value::{NodeId, Slot, Value};
use super::{Node, Store};
use crate::error::{Result, StoreError};
use crate::reactive::{Computed, SameValue, Signal, Source, SourceId};

/// A settable-computed assignment deferred to commit.
pub(crate) struct Assignment {
    pub(crate) computed: Computed,
    pub(crate) node: NodeId,
    pub(crate) value: Value,
    pub(crate) path: String,
}

pub(crate) struct BatchFrame {
    name: Option<String>,
    saved_suppress: bool,
    /// Written signals with their value from before the batch.
    writes: IndexMap<SourceId, (Signal<Slot>, Slot)>,
    /// Sources to notify without a value change (structural touches).
    touched: IndexMap<SourceId, Rc<dyn Source>>,
    assignments: Vec<Assignment>,
}

impl BatchFrame {
    fn new(name: Option<String>, saved_suppress: bool) -> Self {
        Self {
            name,
            saved_suppress,
            writes: IndexMap::new(),
            touched: IndexMap::new(),
            assignments: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.touched.is_empty() && self.assignments.is_empty()
    }

    /// Fold a finished inner frame into this one. The earliest recorded
    /// "before" value of a signal wins.
    fn merge(&mut self, child: BatchFrame) {
        for (id, write) in child.writes {
            self.writes.entry(id).or_insert(write);
        }
        for (id, source) in child.touched {
            self.touched.entry(id).or_insert(source);
        }
        self.assignments.extend(child.assignments);
    }
}

#[derive(Default)]
pub(crate) struct BatchStack {
    frames: Vec<BatchFrame>,
}

impl BatchStack {
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn record_write(&mut self, signal: &Signal<Slot>, before: Slot) {
        if let Some(frame) = self.frames.last_mut() {
            frame
                .writes
                .entry(signal.id())
                .or_insert_with(|| (signal.clone(), before));
        }
    }

    pub(crate) fn record_touch(&mut self, source: Rc<dyn Source>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.touched.entry(source.source_id()).or_insert(source);
        }
    }

    pub(crate) fn record_assignment(&mut self, assignment: Assignment) {
        if let Some(frame) = self.frames.last_mut() {
            frame.assignments.push(assignment);
        }
    }

    fn push(&mut self, frame: BatchFrame) -> usize {
        self.frames.push(frame);
        self.frames.len()
    }

    fn pop(&mut self) -> Option<BatchFrame> {
        self.frames.pop()
    }

    fn top_mut(&mut self) -> Option<&mut BatchFrame> {
        self.frames.last_mut()
    }

    /// Remove the frame at `depth` (1-based) and everything above it,
    /// folded into one frame.
    fn unwind_to(&mut self, depth: usize) -> Option<BatchFrame> {
        if depth == 0 || depth > self.frames.len() {
            return None;
        }
        let mut removed = self.frames.split_off(depth - 1).into_iter();
        let mut base = removed.next()?;
        for frame in removed {
            base.merge(frame);
        }
        Some(base)
    }
}

/// Unwinds an open batch on drop unless disarmed.
pub(crate) struct BatchGuard<'a> {
    store: &'a Store,
    depth: usize,
    armed: bool,
}

impl BatchGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.abort_batch(self.depth);
        }
    }
}

impl Store {
    /// Run `f` as one batch and notify once at the end.
    ///
    /// ```rust
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    /// use weave_core::store;
    ///
    /// let s = store(serde_json::json!({"x": 0, "y": 0}));
    /// let calls = Rc::new(Cell::new(0));
    /// let seen = calls.clone();
    /// s.subscribe(move |state, _| {
    ///     state.get("x");
    ///     state.get("y");
    ///     seen.set(seen.get() + 1);
    /// });
    ///
    /// s.batch(|| {
    ///     s.set("x", 1).unwrap();
    ///     s.set("y", 2).unwrap();
    /// });
    /// assert_eq!(calls.get(), 2);
    /// ```
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.run_batch(None, f)
    }

    /// Like [`Store::batch`], with a name that shows up in logs.
    pub fn batch_named<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        self.run_batch(Some(name), f)
    }

    /// Run a fallible closure as one batch.
    ///
    /// On `Err` the batch is unwound without notifying: values already
    /// written stay, every computed value is invalidated.
    pub fn try_batch<R, E>(
        &self,
        f: impl FnOnce() -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E> {
        let guard = self.open_batch(None);
        let result = f()?;
        guard.disarm();
        self.close_batch();
        Ok(result)
    }

    /// Open a batch frame. Pair with [`Store::commit_batch`].
    pub fn begin_batch(&self, name: Option<&str>) {
        let saved = self.inner.suppressed.replace(true);
        let depth = self
            .inner
            .batches
            .borrow_mut()
            .push(BatchFrame::new(name.map(str::to_string), saved));
        tracing::debug!(name = name.unwrap_or(""), depth, "batch opened");
    }

    /// Close the innermost open frame.
    pub fn commit_batch(&self) -> Result<()> {
        if self.inner.batches.borrow().depth() == 0 {
            return Err(StoreError::NoActiveBatch);
        }
        self.close_batch();
        Ok(())
    }

    /// Whether a batch frame is open.
    pub fn is_batching(&self) -> bool {
        self.inner.batches.borrow().depth() > 0
    }

    fn run_batch<R>(&self, name: Option<&str>, f: impl FnOnce() -> R) -> R {
        let guard = self.open_batch(name);
        let result = f();
        guard.disarm();
        self.close_batch();
        result
    }

    fn open_batch(&self, name: Option<&str>) -> BatchGuard<'_> {
        self.begin_batch(name);
        BatchGuard {
            store: self,
            depth: self.inner.batches.borrow().depth(),
            armed: true,
        }
    }

    fn close_batch(&self) {
        let Some(frame) = self.inner.batches.borrow_mut().pop() else {
            return;
        };

        if let Some(parent) = self.inner.batches.borrow_mut().top_mut() {
            tracing::debug!(name = frame.name.as_deref().unwrap_or(""), "batch merged into parent");
            parent.merge(frame);
            return;
        }

        self.commit_frame(frame);
    }

    fn commit_frame(&self, frame: BatchFrame) {
        tracing::debug!(
            name = frame.name.as_deref().unwrap_or(""),
            writes = frame.writes.len(),
            assignments = frame.assignments.len(),
            "batch committing"
        );
        let saved = frame.saved_suppress;
        let had_effect = !frame.is_empty();

        let mut assignments = self.notify_frame(frame);
        self.run_setters(&mut assignments);

        if had_effect {
            self.refresh_all_computed();
        }

        self.inner.suppressed.set(saved);
        self.settle();
    }

    /// Notify the sources a frame recorded and hand back its assignments.
    fn notify_frame(&self, frame: BatchFrame) -> Vec<Assignment> {
        for (_, (signal, before)) in frame.writes {
            if !signal.get_untracked().same_value(&before) {
                signal.notify();
                self.inner.changed.set(true);
            }
        }
        for (_, source) in frame.touched {
            source.notify_subscribers();
            self.inner.changed.set(true);
        }
        frame.assignments
    }

    /// Run deferred setters. Writes they make are captured in a fresh frame
    /// and notified like the batch's own writes; assignments they make run
    /// in the next round.
    fn run_setters(&self, assignments: &mut Vec<Assignment>) {
        let max_rounds = self.inner.config.max_commit_rounds.max(1);
        let mut round = 0;

        while !assignments.is_empty() {
            round += 1;
            if round > max_rounds {
                tracing::warn!(
                    rounds = max_rounds,
                    dropped = assignments.len(),
                    "settable computed values kept assigning each other; dropping the rest"
                );
                assignments.clear();
                break;
            }

            self.inner
                .batches
                .borrow_mut()
                .push(BatchFrame::new(Some("commit".to_string()), true));

            for assignment in assignments.drain(..) {
                let node = Node::new(self.clone(), assignment.node);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    assignment.computed.assign(&node, assignment.value, &assignment.path)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(%err, "deferred assignment failed"),
                    Err(_) => tracing::error!(
                        path = %assignment.path,
                        "computed setter panicked during batch commit"
                    ),
                }
            }

            let captured = self.inner.batches.borrow_mut().pop();
            if let Some(captured) = captured {
                *assignments = self.notify_frame(captured);
            }
        }
    }

    /// Unwind after a failed batch that began at `depth`.
    pub(crate) fn abort_batch(&self, depth: usize) {
        let removed = self.inner.batches.borrow_mut().unwind_to(depth);
        let Some(frame) = removed else {
            return;
        };

        if let Some(parent) = self.inner.batches.borrow_mut().top_mut() {
            tracing::debug!("failed inner batch folded into parent");
            parent.merge(frame);
            return;
        }

        tracing::debug!(
            name = frame.name.as_deref().unwrap_or(""),
            "batch failed; restoring notifications"
        );
        self.inner.suppressed.set(frame.saved_suppress);
        self.invalidate_all_computed();
        self.collect_garbage();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use serde_json::json;

    fn counter(store: &Store, key: &'static str) -> Rc<Cell<u32>> {
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        store.subscribe(move |state, _| {
            state.get(key);
            seen.set(seen.get() + 1);
        });
        calls
    }

    #[test]
    fn nested_frames_notify_once() {
        let store = Store::new(json!({"x": 0, "y": 0}));
        let calls = counter(&store, "x");

        store.batch(|| {
            store.set("x", 1).unwrap();
            store.batch(|| store.set("x", 2).unwrap());
            assert_eq!(calls.get(), 1);
            store.set("x", 3).unwrap();
        });

        assert_eq!(calls.get(), 2);
        assert_eq!(store.get("x"), Value::from(3));
    }

    #[test]
    fn write_and_revert_in_batch_does_not_notify() {
        let store = Store::new(json!({"x": 0}));
        let calls = counter(&store, "x");

        store.batch(|| {
            store.set("x", 1).unwrap();
            store.set("x", 0).unwrap();
        });

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn manual_frames() {
        let store = Store::new(json!({"x": 0}));
        let calls = counter(&store, "x");

        store.begin_batch(Some("manual"));
        assert!(store.is_batching());
        store.set("x", 5).unwrap();
        assert_eq!(calls.get(), 1);
        store.commit_batch().unwrap();

        assert!(!store.is_batching());
        assert_eq!(calls.get(), 2);
        assert_eq!(store.commit_batch(), Err(StoreError::NoActiveBatch));
    }

    #[test]
    fn failed_batch_restores_notifications() {
        let store = Store::new(json!({"x": 0}));
        let calls = counter(&store, "x");

        let result: std::result::Result<(), &str> = store.try_batch(|| {
            store.set("x", 1).unwrap();
            Err("boom")
        });

        assert_eq!(result, Err("boom"));
        assert!(!store.is_batching());
        // The write stays but was not announced.
        assert_eq!(store.get("x"), Value::from(1));
        assert_eq!(calls.get(), 1);

        store.set("x", 2).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn panicking_batch_unwinds_frames() {
        let store = Store::new(json!({"x": 0}));
        let calls = counter(&store, "x");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            store.batch(|| {
                store.begin_batch(Some("left open"));
                store.set("x", 1).unwrap();
                panic!("inside batch");
            })
        }));

        assert!(result.is_err());
        assert!(!store.is_batching());
        store.set("x", 2).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn failed_inner_batch_is_committed_by_outer() {
        let store = Store::new(json!({"x": 0}));
        let calls = counter(&store, "x");

        store.batch(|| {
            let _: std::result::Result<(), ()> = store.try_batch(|| {
                store.set("x", 1).unwrap();
                Err(())
            });
        });

        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn empty_batch_does_not_re_evaluate_computed() {
        let store = Store::new(json!({"a": 1}));
        let runs = Rc::new(Cell::new(0));
        let seen = runs.clone();
        store
            .set(
                "double",
                Computed::new(move |node: &Node| {
                    seen.set(seen.get() + 1);
                    node.get("a").as_f64().unwrap_or(0.0) * 2.0
                }),
            )
            .unwrap();
        assert_eq!(store.get("double"), Value::from(2));
        let before = runs.get();

        store.batch(|| {});
        store.begin_batch(None);
        store.commit_batch().unwrap();
        assert_eq!(runs.get(), before);

        store.batch(|| store.set("a", 2).unwrap());
        assert_eq!(runs.get(), before + 1);
        assert_eq!(store.get("double"), Value::from(4));
        assert_eq!(runs.get(), before + 1);
    }

    #[test]
    fn computed_reads_inside_batch_are_fresh() {
        let store = Store::new(json!({"a": 1}));
        store
            .set("double", Computed::new(|node: &Node| node.get("a").as_f64().unwrap_or(0.0) * 2.0))
            .unwrap();

        store.batch(|| {
            store.set("a", 4).unwrap();
            assert_eq!(store.get("double"), Value::from(8));
        });
    }
}
