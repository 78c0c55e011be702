//! Computed definition history.
//!
//! Every computed definition installed in a store is recorded under its key
//! path and the history position current at installation. A time-travel
//! collaborator advances the position when it records a state and, after
//! undo or redo, asks for the definition that was active at a given point.

use std::collections::{BTreeMap, HashMap};

use crate::reactive::Computed;

#[derive(Default)]
pub(crate) struct ComputedHistory {
    position: usize,
    entries: HashMap<String, BTreeMap<usize, Computed>>,
}

impl ComputedHistory {
    pub(crate) fn position(&self) -> usize {
        self.position
    }

    /// Move to the next position and return it.
    pub(crate) fn advance(&mut self) -> usize {
        self.position += 1;
        self.position
    }

    /// Record `computed` as the definition of `path` from the current
    /// position on. A later install at the same position replaces it.
    pub(crate) fn record(&mut self, path: &str, computed: Computed) {
        self.entries
            .entry(path.to_string())
            .or_default()
            .insert(self.position, computed);
    }

    /// The definition of `path` that was active at `position`.
    pub(crate) fn definition_at(&self, path: &str, position: usize) -> Option<Computed> {
        self.entries
            .get(path)?
            .range(..=position)
            .next_back()
            .map(|(_, computed)| computed.clone())
    }

    /// Paths that have at least one recorded definition.
    pub(crate) fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
