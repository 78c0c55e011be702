//! Integration Tests for the Reactive Store
//!
//! These tests verify that signals, computed values, subscriptions,
//! batches and diffing work together correctly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::json;
use weave_core::graph::{Plain, Snapshot};
use weave_core::reactive::{ReactiveContext, Signal, Subscriber};
use weave_core::{computed, diff, json, store, Computed, Node, Store, StoreError, Value};

fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
    let count = Rc::new(Cell::new(0));
    (count.clone(), count)
}

/// Subscribe with a callback that reads `keys` and counts its runs.
fn watch(store: &Store, keys: &'static [&'static str]) -> Rc<Cell<u32>> {
    let (count, seen) = counter();
    store.subscribe(move |state, _| {
        for key in keys {
            state.get(*key);
        }
        seen.set(seen.get() + 1);
    });
    count
}

/// `{"id": id, "self": <root>}`
fn self_referencing(id: f64) -> Snapshot {
    let mut builder = Snapshot::builder();
    let root = builder.object();
    builder.insert(root, "id", Plain::Number(id));
    builder.insert(root, "self", Plain::Ref(root));
    builder.finish(Plain::Ref(root))
}

/// Writing a field's own value back never notifies.
#[test]
fn self_assignment_never_notifies() {
    let s = store(json!({"n": 1, "nan": null, "obj": {"x": 1}, "list": [1]}));
    s.set("nan", f64::NAN).unwrap();
    let calls = watch(&s, &[]);

    for key in ["n", "nan", "obj", "list"] {
        s.set(key, s.get(key)).unwrap();
    }

    assert_eq!(calls.get(), 1);
}

/// +0 and -0 are different values; NaN equals NaN.
#[test]
fn identity_equality_on_numbers() {
    let s = store(json!({"z": 0.0}));
    let calls = watch(&s, &["z"]);

    s.set("z", -0.0).unwrap();
    assert_eq!(calls.get(), 2);

    s.set("z", f64::NAN).unwrap();
    s.set("z", f64::NAN).unwrap();
    assert_eq!(calls.get(), 3);
}

/// The scenario from the store documentation: one initial log, nothing for
/// an identical write, one log per real change with old and new values.
#[test]
fn counter_scenario() {
    let s = store(json!({"count": 0}));
    let log: Rc<RefCell<Vec<(Value, Option<Plain>)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    s.subscribe(move |state, old| {
        sink.borrow_mut()
            .push((state.get("count"), old.get("count").cloned()));
    });

    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0].0, Value::from(0));

    s.set("count", 0).unwrap();
    assert_eq!(log.borrow().len(), 1);

    s.set("count", 1).unwrap();
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(log.borrow()[1], (Value::from(1), Some(Plain::Number(0.0))));
}

/// A scoped subscriber runs once per change to what it read, never twice.
#[test]
fn subscriber_runs_once_per_intersecting_change() {
    let s = store(json!({"x": 0, "y": 0, "user": {"name": "a"}}));
    let calls = watch(&s, &["x", "user"]);

    s.set("y", 1).unwrap();
    assert_eq!(calls.get(), 1);

    s.set("x", 1).unwrap();
    assert_eq!(calls.get(), 2);

    // Reads `user` directly and through the ancestor touch: still once.
    s.get("user").as_node().unwrap().set("name", "b").unwrap();
    assert_eq!(calls.get(), 3);
}

/// Two subscribers on two fields, one batch: each runs once, after both
/// fields hold their new values.
#[test]
fn batch_notifies_each_subscriber_once_with_final_values() {
    let s = store(json!({"x": 0, "y": 0}));
    let seen: Rc<RefCell<Vec<(&str, Value, Value)>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = seen.clone();
    s.subscribe(move |state, _| {
        let x = state.get("x");
        sink.borrow_mut().push(("f1", x, ReactiveContext::without_tracking(|| state.get("y"))));
    });
    let sink = seen.clone();
    s.subscribe(move |state, _| {
        let y = state.get("y");
        sink.borrow_mut().push(("f2", ReactiveContext::without_tracking(|| state.get("x")), y));
    });
    seen.borrow_mut().clear();

    s.batch(|| {
        s.set("x", 1).unwrap();
        s.set("y", 2).unwrap();
    });

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    for (_, x, y) in seen.iter() {
        assert_eq!((x, y), (&Value::from(1), &Value::from(2)));
    }
}

/// A computed sum reflects source changes and is cached in between.
#[test]
fn computed_is_lazy_and_cached() {
    let s = store(json!({"a": 1, "b": 2}));
    let (runs, seen) = counter();
    s.set(
        "sum",
        computed(move |node| {
            seen.set(seen.get() + 1);
            node.get("a").as_f64().unwrap_or(0.0) + node.get("b").as_f64().unwrap_or(0.0)
        }),
    )
    .unwrap();
    assert_eq!(runs.get(), 0);

    assert_eq!(s.get("sum"), Value::from(3));
    s.set("a", 5).unwrap();
    assert_eq!(s.get("sum"), Value::from(7));
    assert_eq!(runs.get(), 2);

    assert_eq!(s.get("sum"), Value::from(7));
    assert_eq!(runs.get(), 2);
}

/// Subscribers reading a computed key hear about its sources.
#[test]
fn subscriber_reading_computed_hears_sources() {
    let s = store(json!({"first": "Ada", "last": "L"}));
    s.set(
        "full",
        computed(|node| {
            format!(
                "{} {}",
                node.get("first").as_str().unwrap_or(""),
                node.get("last").as_str().unwrap_or("")
            )
        }),
    )
    .unwrap();

    let calls = watch(&s, &["full"]);
    s.set("last", "Lovelace").unwrap();
    assert_eq!(calls.get(), 2);
    assert_eq!(s.get("full"), Value::from("Ada Lovelace"));
}

/// Settable computed values route assignments to their setter; plain
/// computed values reject them.
#[test]
fn settable_computed() {
    let s = store(json!({"first": "a", "last": "b"}));
    s.set(
        "full",
        Computed::new(|node: &Node| {
            format!(
                "{} {}",
                node.get("first").as_str().unwrap_or(""),
                node.get("last").as_str().unwrap_or("")
            )
        })
        .with_setter(|node: &Node, value: Value| {
            let text = value.as_str().unwrap_or("").to_string();
            let mut parts = text.splitn(2, ' ');
            node.set("first", parts.next().unwrap_or("")).unwrap();
            node.set("last", parts.next().unwrap_or("")).unwrap();
        }),
    )
    .unwrap();

    s.set("full", "Grace Hopper").unwrap();
    assert_eq!(s.get("first"), Value::from("Grace"));
    assert_eq!(s.get("full"), Value::from("Grace Hopper"));

    s.set("fixed", computed(|_| 1)).unwrap();
    assert_eq!(
        s.set("fixed", 2),
        Err(StoreError::ComputedWithoutSetter { path: "fixed".into() })
    );
}

/// Inside a batch, setters run after plain fields are applied.
#[test]
fn batch_runs_setters_after_plain_fields() {
    let s = store(json!({"base": 1, "scaled": 0}));
    s.set(
        "target",
        Computed::new(|node: &Node| node.get("scaled")).with_setter(|node: &Node, value: Value| {
            let base = node.get("base").as_f64().unwrap_or(0.0);
            let wanted = value.as_f64().unwrap_or(0.0);
            node.set("scaled", wanted * base).unwrap();
        }),
    )
    .unwrap();
    let calls = watch(&s, &["target"]);

    s.batch(|| {
        s.set("target", 3).unwrap();
        s.set("base", 10).unwrap();
    });

    assert_eq!(s.get("scaled"), Value::from(30));
    assert_eq!(s.get("target"), Value::from(30));
    assert_eq!(calls.get(), 2);
}

/// `json(store(x))` is deeply equal to `x` for cycle-free input.
#[test]
fn json_round_trips_plain_objects() {
    let input = json!({
        "name": "weave",
        "tags": ["a", "b"],
        "nested": {"deep": {"n": 1.5, "ok": true, "none": null}},
        "empty": {}
    });
    let s = store(input.clone());
    assert_eq!(json(&s).to_json().unwrap(), input);
    assert_eq!(json(&s), Snapshot::from(input));
}

/// Cycles survive snapshots and refuse tree serialization.
#[test]
fn cyclic_state_is_preserved() {
    let s = store(json!({"child": {"name": "c"}}));
    let child = s.get("child");
    child.as_node().unwrap().set("parent", s.root()).unwrap();

    let snapshot = json(&s);
    assert!(snapshot.is_cyclic());
    assert_eq!(snapshot.at(&["child", "parent"]), Some(snapshot.root()));
    assert!(s.to_json().is_err());
}

/// `diff(a, a)` is the no-difference sentinel, cycles included.
#[test]
fn diff_of_equal_inputs_is_no_difference() {
    let a = self_referencing(1.0);
    assert!(diff(&a, &a).is_no_difference());

    let s = store(json!({"x": [1, {"y": 2}]}));
    assert!(diff(&s, &json(&s)).is_no_difference());
}

/// Self-references at the same position produce a circular marker.
#[test]
fn diff_marks_cycles() {
    let d = diff(&self_referencing(1.0), &self_referencing(2.0));
    assert!(d.contains_circular());
    assert_eq!(
        serde_json::to_value(&d).unwrap(),
        json!({"id": {"__old": 1, "__new": 2}, "self": {"__circular": true}})
    );

    let plain = diff(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}));
    assert!(!plain.contains_circular());
}

/// Diffing live stores resolves computed values.
#[test]
fn diff_between_store_states() {
    let s = store(json!({"a": 1}));
    s.set("double", computed(|node| node.get("a").as_f64().unwrap_or(0.0) * 2.0))
        .unwrap();

    let before = json(&s);
    s.set("a", 2).unwrap();
    s.set("added", true).unwrap();

    assert_eq!(
        serde_json::to_value(diff(&before, &s)).unwrap(),
        json!({
            "a": {"__old": 1, "__new": 2},
            "double": {"__old": 2, "__new": 4},
            "added": {"__added": true}
        })
    );
}

/// A failing batch never leaves the store silent.
#[test]
fn failed_batch_keeps_store_notifying() {
    let s = store(json!({"x": 0}));
    let calls = watch(&s, &["x"]);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        s.batch(|| {
            s.set("x", 1).unwrap();
            panic!("batched function failed");
        })
    }));
    assert!(result.is_err());

    s.set("x", 2).unwrap();
    assert_eq!(calls.get(), 2);
}

/// A subscriber may unsubscribe another one mid-delivery.
#[test]
fn unsubscribe_during_delivery() {
    let s = store(json!({"x": 0}));
    let victim = Rc::new(RefCell::new(None::<weave_core::Subscription>));
    let (victim_calls, seen) = counter();

    let slot = victim.clone();
    s.subscribe(move |state, _| {
        state.get("x");
        if let Some(subscription) = slot.borrow().as_ref() {
            subscription.unsubscribe();
        }
    });
    let subscription = s.subscribe(move |state, _| {
        state.get("x");
        seen.set(seen.get() + 1);
    });
    *victim.borrow_mut() = Some(subscription);

    s.set("x", 1).unwrap();
    s.set("x", 2).unwrap();
    assert_eq!(victim_calls.get(), 1);
    assert_eq!(s.subscriber_count(), 1);
}

/// A subscriber writing to the store during delivery is delivered again
/// for its own write, not skipped.
#[test]
fn reentrant_write_from_subscriber() {
    let s = store(json!({"x": 0, "echo": 0}));
    let echo = watch(&s, &["echo"]);

    let writer = s.clone();
    s.subscribe(move |state, _| {
        let x = state.get("x");
        writer.set("echo", x).unwrap();
    });

    s.set("x", 5).unwrap();
    assert_eq!(s.get("echo"), Value::from(5));
    assert_eq!(echo.get(), 2);
}

/// The tracking context attributes reads to the innermost computation.
#[test]
fn nested_tracking_contexts() {
    let outer_signal = Signal::new(1u64);
    let inner_signal = Signal::new(2u64);
    let (outer_hits, outer_seen) = counter();
    let (inner_hits, inner_seen) = counter();

    {
        let outer = ReactiveContext::enter(Subscriber::new(move || outer_seen.set(outer_seen.get() + 1)));
        outer_signal.get();
        {
            let _inner =
                ReactiveContext::enter(Subscriber::new(move || inner_seen.set(inner_seen.get() + 1)));
            inner_signal.get();
        }
        assert_eq!(ReactiveContext::dependency_ids(), vec![outer_signal.id()]);
        drop(outer);
    }

    inner_signal.set(3);
    assert_eq!((outer_hits.get(), inner_hits.get()), (0, 1));
    outer_signal.set(2);
    assert_eq!((outer_hits.get(), inner_hits.get()), (1, 1));
}
