//! Structural Diff
//!
//! `diff` runs in two passes with independent cycle bookkeeping:
//!
//! 1. A deep-equality check. A pair of composites that is revisited while
//!    it is still being compared counts as equal, which makes symmetric
//!    cycles terminate. If the snapshots are equal the result is
//!    [`Diff::NoDifference`].
//!
//! 2. A tree builder that walks both sides key by key. It keeps the pairs
//!    currently being expanded on its path from the root; meeting one of
//!    those again is a real cycle and yields [`DiffNode::Circular`]. A
//!    sub-object shared by two keys is not on the path twice, so it never
//!    produces a circular marker.
//!
//! Both passes remember the pairs they have settled, so every pair of
//! composites is compared and expanded at most once. Shared sub-objects
//! share their entry in the resulting tree.
//!
//! Batch-control names are excluded at the root on both sides.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use super::snapshot::{Composite, Handle, Plain, Snapshot};
use crate::store::is_reserved;

type Pair = (Handle, Handle);

/// One entry of a diff tree.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffNode {
    /// Present only on the right-hand side.
    Added(Snapshot),
    /// Present only on the left-hand side.
    Removed(Snapshot),
    /// Present on both sides with different primitive values or kinds.
    Changed { old: Snapshot, new: Snapshot },
    /// The walk met a pair of composites it is already expanding.
    Circular,
    /// Both sides are composites of the same kind; only differing keys are
    /// kept. Pairs reached along several paths share one map.
    Nested(Rc<IndexMap<String, DiffNode>>),
}

impl DiffNode {
    /// Child entry of a nested node.
    pub fn get(&self, key: &str) -> Option<&DiffNode> {
        match self {
            DiffNode::Nested(children) => children.get(key),
            _ => None,
        }
    }

    /// Follow a path of keys through nested nodes.
    pub fn at(&self, path: &[&str]) -> Option<&DiffNode> {
        path.iter().try_fold(self, |node, key| node.get(key))
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, DiffNode::Circular)
    }

    /// Whether a circular marker appears anywhere in this subtree.
    pub fn contains_circular(&self) -> bool {
        fn walk(node: &DiffNode, seen: &mut HashSet<*const IndexMap<String, DiffNode>>) -> bool {
            match node {
                DiffNode::Circular => true,
                DiffNode::Nested(children) => {
                    seen.insert(Rc::as_ptr(children))
                        && children.values().any(|child| walk(child, seen))
                }
                _ => false,
            }
        }
        walk(self, &mut HashSet::new())
    }
}

impl Serialize for DiffNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DiffNode::Added(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("__added", value)?;
                map.end()
            }
            DiffNode::Removed(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("__removed", value)?;
                map.end()
            }
            DiffNode::Changed { old, new } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("__old", old)?;
                map.serialize_entry("__new", new)?;
                map.end()
            }
            DiffNode::Circular => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("__circular", &true)?;
                map.end()
            }
            DiffNode::Nested(children) => {
                let mut map = serializer.serialize_map(Some(children.len()))?;
                for (key, child) in children.iter() {
                    map.serialize_entry(key, child)?;
                }
                map.end()
            }
        }
    }
}

/// Result of [`diff_snapshots`].
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// The sentinel for deeply equal inputs.
    NoDifference,
    Changed(DiffNode),
}

impl Diff {
    pub fn is_no_difference(&self) -> bool {
        matches!(self, Diff::NoDifference)
    }

    /// The diff tree, if the inputs differ.
    pub fn tree(&self) -> Option<&DiffNode> {
        match self {
            Diff::NoDifference => None,
            Diff::Changed(node) => Some(node),
        }
    }

    /// Follow a path of keys into the diff tree.
    pub fn at(&self, path: &[&str]) -> Option<&DiffNode> {
        self.tree()?.at(path)
    }

    pub fn contains_circular(&self) -> bool {
        self.tree().is_some_and(DiffNode::contains_circular)
    }
}

impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Diff::NoDifference => serializer.serialize_none(),
            Diff::Changed(node) => node.serialize(serializer),
        }
    }
}

/// Cycle-tolerant deep equality of two snapshots.
pub fn deep_equal(a: &Snapshot, b: &Snapshot) -> bool {
    Equality::new(a, b).values(a.root(), b.root(), true)
}

/// Compare two snapshots and describe what changed from `a` to `b`.
///
/// ```rust
/// use serde_json::json;
/// use weave_core::graph::{diff_snapshots, Snapshot};
///
/// let a = Snapshot::from(json!({"count": 0, "name": "x"}));
/// let b = Snapshot::from(json!({"count": 1, "name": "x"}));
///
/// let diff = diff_snapshots(&a, &b);
/// assert_eq!(
///     serde_json::to_value(&diff).unwrap(),
///     json!({"count": {"__old": 0, "__new": 1}})
/// );
/// assert!(diff_snapshots(&a, &a).is_no_difference());
/// ```
pub fn diff_snapshots(a: &Snapshot, b: &Snapshot) -> Diff {
    let mut equality = Equality::new(a, b);
    if equality.values(a.root(), b.root(), true) {
        return Diff::NoDifference;
    }

    let mut builder = DiffBuilder {
        a,
        b,
        equality,
        in_progress: HashSet::new(),
        finished: HashMap::new(),
    };
    match builder.value(a.root(), b.root(), true) {
        Some(node) => Diff::Changed(node),
        None => Diff::NoDifference,
    }
}

/// Memoized equality over pairs of composites.
///
/// A pair met again while it is open is assumed equal. A `false` result
/// never depends on an assumption and is settled at once. A `true` result
/// that leaned on an open pair stays provisional until that pair settles:
/// it is kept if the pair turns out equal and forgotten otherwise.
struct Equality<'a> {
    a: &'a Snapshot,
    b: &'a Snapshot,
    settled: HashMap<Pair, bool>,
    /// Open pairs with their depth on the comparison stack.
    open: HashMap<Pair, usize>,
    provisional: Vec<Pair>,
}

/// No assumption about an open pair was made.
const NO_ASSUMPTION: usize = usize::MAX;

impl<'a> Equality<'a> {
    fn new(a: &'a Snapshot, b: &'a Snapshot) -> Self {
        Self {
            a,
            b,
            settled: HashMap::new(),
            open: HashMap::new(),
            provisional: Vec::new(),
        }
    }

    fn values(&mut self, va: &Plain, vb: &Plain, at_root: bool) -> bool {
        self.compare(va, vb, at_root).0
    }

    /// The result, and the shallowest open depth it assumed equal.
    fn compare(&mut self, va: &Plain, vb: &Plain, at_root: bool) -> (bool, usize) {
        let pair = match (va, vb) {
            (Plain::Ref(ha), Plain::Ref(hb)) => (*ha, *hb),
            (Plain::Ref(_), _) | (_, Plain::Ref(_)) => return (false, NO_ASSUMPTION),
            (pa, pb) => return (pa == pb, NO_ASSUMPTION),
        };

        if let Some(&equal) = self.settled.get(&pair) {
            return (equal, NO_ASSUMPTION);
        }
        if let Some(&depth) = self.open.get(&pair) {
            return (true, depth);
        }

        let depth = self.open.len();
        self.open.insert(pair, depth);
        let mark = self.provisional.len();
        let (equal, assumed) = self.composites(pair, at_root);
        self.open.remove(&pair);

        if !equal {
            self.provisional.truncate(mark);
            self.settled.insert(pair, false);
            (false, NO_ASSUMPTION)
        } else if assumed >= depth {
            for settled in self.provisional.drain(mark..) {
                self.settled.insert(settled, true);
            }
            self.settled.insert(pair, true);
            (true, NO_ASSUMPTION)
        } else {
            self.provisional.push(pair);
            (true, assumed)
        }
    }

    fn composites(&mut self, (ha, hb): Pair, at_root: bool) -> (bool, usize) {
        let (a, b) = (self.a, self.b);
        let mut assumed = NO_ASSUMPTION;

        match (a.composite(ha), b.composite(hb)) {
            (Composite::Object(ma), Composite::Object(mb)) => {
                let keep = |key: &String| !(at_root && is_reserved(key));
                if ma.keys().filter(|k| keep(k)).count() != mb.keys().filter(|k| keep(k)).count() {
                    return (false, NO_ASSUMPTION);
                }
                for (key, ca) in ma.iter().filter(|(k, _)| keep(k)) {
                    let Some(cb) = mb.get(key) else {
                        return (false, NO_ASSUMPTION);
                    };
                    let (equal, depth) = self.compare(ca, cb, false);
                    if !equal {
                        return (false, NO_ASSUMPTION);
                    }
                    assumed = assumed.min(depth);
                }
            }
            (Composite::Array(la), Composite::Array(lb)) => {
                if la.len() != lb.len() {
                    return (false, NO_ASSUMPTION);
                }
                for (ca, cb) in la.iter().zip(lb) {
                    let (equal, depth) = self.compare(ca, cb, false);
                    if !equal {
                        return (false, NO_ASSUMPTION);
                    }
                    assumed = assumed.min(depth);
                }
            }
            _ => return (false, NO_ASSUMPTION),
        }
        (true, assumed)
    }
}

struct DiffBuilder<'a> {
    a: &'a Snapshot,
    b: &'a Snapshot,
    equality: Equality<'a>,
    /// Pairs on the path from the root to the current position.
    in_progress: HashSet<Pair>,
    /// Pairs already expanded, reused when reached along another path.
    finished: HashMap<Pair, Option<DiffNode>>,
}

impl DiffBuilder<'_> {
    fn value(&mut self, va: &Plain, vb: &Plain, at_root: bool) -> Option<DiffNode> {
        let pair = match (va, vb) {
            (Plain::Ref(ha), Plain::Ref(hb)) => Some((*ha, *hb)),
            _ => None,
        };

        let Some(pair) = pair else {
            return (va != vb).then(|| self.changed(va, vb));
        };

        if self.in_progress.contains(&pair) {
            return Some(DiffNode::Circular);
        }
        if let Some(done) = self.finished.get(&pair) {
            return done.clone();
        }

        let (a, b) = (self.a, self.b);
        self.in_progress.insert(pair);
        let result = match (a.composite(pair.0), b.composite(pair.1)) {
            (Composite::Object(ma), Composite::Object(mb)) => nested(self.objects(ma, mb, at_root)),
            (Composite::Array(la), Composite::Array(lb)) => nested(self.arrays(la, lb)),
            _ => Some(self.changed(va, vb)),
        };
        self.in_progress.remove(&pair);

        self.finished.insert(pair, result.clone());
        result
    }

    fn objects(
        &mut self,
        ma: &IndexMap<String, Plain>,
        mb: &IndexMap<String, Plain>,
        at_root: bool,
    ) -> IndexMap<String, DiffNode> {
        let mut out = IndexMap::new();
        let keep = |key: &str| !(at_root && is_reserved(key));

        for (key, ca) in ma.iter().filter(|(k, _)| keep(k)) {
            let entry = match mb.get(key) {
                Some(cb) => self.child(ca, cb),
                None => Some(DiffNode::Removed(self.a.subtree(ca))),
            };
            if let Some(entry) = entry {
                out.insert(key.clone(), entry);
            }
        }
        for (key, cb) in mb.iter().filter(|(k, _)| keep(k)) {
            if !ma.contains_key(key) {
                out.insert(key.clone(), DiffNode::Added(self.b.subtree(cb)));
            }
        }
        out
    }

    fn arrays(&mut self, la: &[Plain], lb: &[Plain]) -> IndexMap<String, DiffNode> {
        let mut out = IndexMap::new();
        for index in 0..la.len().max(lb.len()) {
            let entry = match (la.get(index), lb.get(index)) {
                (Some(ca), Some(cb)) => self.child(ca, cb),
                (Some(ca), None) => Some(DiffNode::Removed(self.a.subtree(ca))),
                (None, Some(cb)) => Some(DiffNode::Added(self.b.subtree(cb))),
                (None, None) => None,
            };
            if let Some(entry) = entry {
                out.insert(index.to_string(), entry);
            }
        }
        out
    }

    /// Diff a pair of children, skipping the walk when they are equal.
    fn child(&mut self, ca: &Plain, cb: &Plain) -> Option<DiffNode> {
        if self.equality.values(ca, cb, false) {
            return None;
        }
        self.value(ca, cb, false)
    }

    fn changed(&self, va: &Plain, vb: &Plain) -> DiffNode {
        DiffNode::Changed {
            old: self.a.subtree(va),
            new: self.b.subtree(vb),
        }
    }
}

fn nested(children: IndexMap<String, DiffNode>) -> Option<DiffNode> {
    (!children.is_empty()).then(|| DiffNode::Nested(Rc::new(children)))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
