//! Branch diff detection.
//!
//! Artifacts are content-addressed, so an `(object_id, checksum,
//! display_label, storage_id)` tuple present on the branch but absent from
//! the baseline is "changed on this branch" regardless of render timing.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::store::ArtifactStore;
use crate::types::{Artifact, ArtifactKey, BranchDiffEntry};

/// `branch − baseline` over full artifact tuples, keyed by `(object_id, checksum)`.
///
/// `updated_at` is ignored. When two branch tuples share a key the later
/// one's label wins.
pub fn branch_difference(branch: &[Artifact], baseline: &[Artifact]) -> Vec<BranchDiffEntry> {
    let tuple = |a: &Artifact| {
        (
            a.object_id.clone(),
            a.checksum.clone(),
            a.display_label.clone(),
            a.storage_id.clone(),
        )
    };
    let baseline: HashSet<_> = baseline.iter().map(tuple).collect();

    let mut changed: BTreeMap<ArtifactKey, String> = BTreeMap::new();
    for artifact in branch {
        if baseline.contains(&tuple(artifact)) {
            continue;
        }
        changed.insert(
            ArtifactKey::new(&artifact.object_id, &artifact.checksum),
            artifact.display_label.clone(),
        );
    }

    changed
        .into_iter()
        .map(|(key, display_label)| BranchDiffEntry {
            object_id: key.object_id,
            expected_checksum: key.checksum,
            display_label,
        })
        .collect()
}

/// Fetch both artifact sets and diff them. Either fetch failing fails the call.
pub async fn detect(
    store: &dyn ArtifactStore,
    branch: &str,
    baseline: &str,
) -> Result<Vec<BranchDiffEntry>> {
    let on_branch = store.list_artifacts(branch).await?;
    let on_baseline = store.list_artifacts(baseline).await?;
    let entries = branch_difference(&on_branch, &on_baseline);
    tracing::debug!(
        branch,
        baseline,
        branch_artifacts = on_branch.len(),
        baseline_artifacts = on_baseline.len(),
        changed = entries.len(),
        "computed branch diff"
    );
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
