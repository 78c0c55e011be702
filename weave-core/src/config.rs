//! Store configuration.
//!
//! Configuration is plain data with serde support so a host application
//! can keep it next to its own settings. Every field has a default; an
//! empty document deserializes to [`StoreConfig::default`].

use serde::{Deserialize, Serialize};

/// Default cap for the computed recompute loop.
pub const DEFAULT_MAX_RECOMPUTE_ITERATIONS: usize = 5;

/// Default cap for cascading setter rounds during a batch commit.
pub const DEFAULT_MAX_COMMIT_ROUNDS: usize = 5;

/// Default number of missing positions a single array write may fill with
/// `null`.
pub const DEFAULT_MAX_INDEX_GAP: usize = 1024;

/// Tunables for a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How many times a computed value may re-run in one access when its
    /// own evaluation dirties it again. After the cap a warning is logged
    /// and the last result is returned.
    pub max_recompute_iterations: usize,

    /// How many rounds of settable-computed setters a batch commit runs
    /// when setters write to other settable-computed keys.
    pub max_commit_rounds: usize,

    /// Record every computed definition in the per-store history table.
    pub track_history: bool,

    /// How far past the end of an array a write may land. The positions in
    /// between are filled with `null`; a write further out is rejected as
    /// an invalid key.
    pub max_index_gap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_recompute_iterations: DEFAULT_MAX_RECOMPUTE_ITERATIONS,
            max_commit_rounds: DEFAULT_MAX_COMMIT_ROUNDS,
            track_history: true,
            max_index_gap: DEFAULT_MAX_INDEX_GAP,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_recompute_iterations(mut self, iterations: usize) -> Self {
        self.max_recompute_iterations = iterations.max(1);
        self
    }

    pub fn with_max_commit_rounds(mut self, rounds: usize) -> Self {
        self.max_commit_rounds = rounds.max(1);
        self
    }

    pub fn with_history(mut self, enabled: bool) -> Self {
        self.track_history = enabled;
        self
    }

    pub fn with_max_index_gap(mut self, gap: usize) -> Self {
        self.max_index_gap = gap;
        self
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.max_recompute_iterations, 5);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"max_recompute_iterations": 2, "track_history": false}"#)
                .unwrap();
        assert_eq!(config.max_recompute_iterations, 2);
        assert_eq!(config.max_commit_rounds, DEFAULT_MAX_COMMIT_ROUNDS);
        assert!(!config.track_history);
        assert_eq!(config.max_index_gap, DEFAULT_MAX_INDEX_GAP);
    }

    #[test]
    fn builders_clamp_to_one() {
        let config = StoreConfig::new().with_max_recompute_iterations(0);
        assert_eq!(config.max_recompute_iterations, 1);
    }
}
