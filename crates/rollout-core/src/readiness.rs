use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{ArtifactKey, BranchDiffEntry};

/// Artifacts confirmed ready by external signal during one run.
///
/// Grows monotonically for the lifetime of the run; keys are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadinessSet(BTreeSet<ArtifactKey>);

impl ReadinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: ArtifactKey) -> bool {
        self.0.insert(key)
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.0.contains(key)
    }

    /// Keys of `entries` that have not been signalled yet.
    pub fn missing(&self, entries: &[BranchDiffEntry]) -> Vec<ArtifactKey> {
        entries
            .iter()
            .map(BranchDiffEntry::key)
            .filter(|k| !self.0.contains(k))
            .collect()
    }

    /// True when every entry's key has been signalled.
    pub fn covers(&self, entries: &[BranchDiffEntry]) -> bool {
        entries.iter().all(|e| self.0.contains(&e.key()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactKey> {
        self.0.iter()
    }
}
