use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, RolloutError};

/// Root path used for full-document replaces and for the no-op sentinel.
pub const ROOT_PATH: &str = "/";

/// Change descriptor recorded for an apply that changed nothing.
pub const NO_CHANGES: &str = "NO CHANGES";

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A rendered configuration document for one managed object.
///
/// Content-addressed: a new render yields a new `(checksum, storage_id)`
/// pair, an existing artifact is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub object_id: String,
    pub checksum: String,
    pub display_label: String,
    pub storage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The artifact currently rendered for a device on the baseline branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceArtifact {
    pub checksum: String,
    pub storage_id: String,
}

// ---------------------------------------------------------------------------
// ArtifactKey / BranchDiffEntry
// ---------------------------------------------------------------------------

/// `(object_id, checksum)` identifies one specific render of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub object_id: String,
    pub checksum: String,
}

impl ArtifactKey {
    pub fn new(object_id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            checksum: checksum.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object_id, self.checksum)
    }
}

/// An object whose artifact changed on a branch and still has to be rolled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDiffEntry {
    pub object_id: String,
    pub expected_checksum: String,
    pub display_label: String,
}

impl BranchDiffEntry {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.object_id, &self.expected_checksum)
    }
}

// ---------------------------------------------------------------------------
// ConfigDiff
// ---------------------------------------------------------------------------

/// Config path → ordered change descriptors (`"<op> <value>"`).
pub type PathChanges = BTreeMap<String, Vec<String>>;

/// Device name → per-path changes produced by applying its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDiff(BTreeMap<String, PathChanges>);

impl ConfigDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A diff for one device. Empty `changes` become the `NO CHANGES` sentinel.
    pub fn for_device(device: impl Into<String>, changes: PathChanges) -> Self {
        let changes = if changes.is_empty() {
            no_changes()
        } else {
            changes
        };
        let mut map = BTreeMap::new();
        map.insert(device.into(), changes);
        Self(map)
    }

    /// Merge another diff into this one. Devices are disjoint within a run,
    /// so a repeated device simply keeps the latest changes.
    pub fn merge(&mut self, other: ConfigDiff) {
        self.0.extend(other.0);
    }

    pub fn device(&self, name: &str) -> Option<&PathChanges> {
        self.0.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The `{"/": ["NO CHANGES"]}` sentinel.
pub fn no_changes() -> PathChanges {
    let mut changes = PathChanges::new();
    changes.insert(ROOT_PATH.to_string(), vec![NO_CHANGES.to_string()]);
    changes
}

// ---------------------------------------------------------------------------
// RolloutRequest / ReadinessSignal
// ---------------------------------------------------------------------------

/// The two trigger shapes accepted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutRequest {
    /// Roll out every device whose artifact changed on `branch`.
    ProposedChange {
        proposed_change_id: String,
        branch: String,
    },
    /// Roll out a single object at a caller-supplied checksum.
    Portkey { target_id: String, checksum: String },
}

impl RolloutRequest {
    /// Durable run id. Also the idempotency key: one live run per id.
    pub fn run_id(&self) -> String {
        match self {
            Self::ProposedChange {
                proposed_change_id, ..
            } => format!("proposed-change-{proposed_change_id}"),
            Self::Portkey { target_id, .. } => format!("portkey-{target_id}"),
        }
    }

    /// Child process id for `device` dispatched by this request.
    pub fn child_id(&self, device: &str) -> String {
        match self {
            Self::ProposedChange {
                proposed_change_id, ..
            } => format!("{device}-proposed-change-{proposed_change_id}"),
            Self::Portkey { target_id, .. } => format!("{device}-portkey-{target_id}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProposedChange { .. } => "proposed_change",
            Self::Portkey { .. } => "portkey",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields: [(&str, &str); 2] = match self {
            Self::ProposedChange {
                proposed_change_id,
                branch,
            } => [
                ("proposed_change_id", proposed_change_id.as_str()),
                ("branch", branch.as_str()),
            ],
            Self::Portkey {
                target_id,
                checksum,
            } => [("target_id", target_id.as_str()), ("checksum", checksum.as_str())],
        };
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(RolloutError::InvalidRequest(format!(
                    "'{name}' must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// "This object's artifact has finished rendering at this checksum."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSignal {
    pub target_id: String,
    pub checksum: String,
}

impl ReadinessSignal {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.target_id, &self.checksum)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_follow_trigger_shape() {
        let pc = RolloutRequest::ProposedChange {
            proposed_change_id: "42".into(),
            branch: "feature-x".into(),
        };
        assert_eq!(pc.run_id(), "proposed-change-42");
        assert_eq!(pc.child_id("router1"), "router1-proposed-change-42");

        let pk = RolloutRequest::Portkey {
            target_id: "R1".into(),
            checksum: "c2".into(),
        };
        assert_eq!(pk.run_id(), "portkey-R1");
        assert_eq!(pk.child_id("router1"), "router1-portkey-R1");
    }

    #[test]
    fn empty_changes_become_sentinel() {
        let diff = ConfigDiff::for_device("leaf1", PathChanges::new());
        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json, serde_json::json!({"leaf1": {"/": ["NO CHANGES"]}}));
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let req = RolloutRequest::Portkey {
            target_id: "R1".into(),
            checksum: " ".into(),
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn request_serializes_with_type_tag() {
        let req = RolloutRequest::ProposedChange {
            proposed_change_id: "1".into(),
            branch: "b".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "proposed_change");
    }
}
