//! Durable run records.
//!
//! A `RunRecord` is the complete recorded progress of one coordinator run:
//! its request, its coordinator state, the diff it computed, the readiness
//! signals it has seen and the lifecycle of every device process it
//! dispatched. The engine writes the record before each suspension point,
//! so a restarted host can re-enter the run where it stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::readiness::ReadinessSet;
use crate::types::{BranchDiffEntry, ConfigDiff, ReadinessSignal, RolloutRequest};

// ---------------------------------------------------------------------------
// CoordinatorState
// ---------------------------------------------------------------------------

/// Coordinator lifecycle.
///
/// Transitions: `Init → DiffComputed → AwaitingReadiness → Dispatched →
/// Gathered | Failed`. Portkey runs go straight from `Init` to `Dispatched`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoordinatorState {
    Init,
    DiffComputed,
    AwaitingReadiness,
    Dispatched,
    Gathered { result: ConfigDiff },
    Failed { reason: String },
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Gathered { .. } | Self::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::DiffComputed => "diff_computed",
            Self::AwaitingReadiness => "awaiting_readiness",
            Self::Dispatched => "dispatched",
            Self::Gathered { .. } => "gathered",
            Self::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceState
// ---------------------------------------------------------------------------

/// Device configuration process lifecycle.
///
/// Transitions: `PollingArtifact → ArtifactReady → Applying → Done | Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    PollingArtifact,
    /// The expected checksum is rendered and stored under `storage_id`.
    ArtifactReady { storage_id: String },
    /// The decoded document about to be (or being) applied.
    Applying { document: serde_json::Value },
    Done { diff: ConfigDiff },
    Failed { reason: String },
}

impl DeviceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PollingArtifact => "polling_artifact",
            Self::ArtifactReady { .. } => "artifact_ready",
            Self::Applying { .. } => "applying",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// ChildRecord
// ---------------------------------------------------------------------------

/// One dispatched device configuration process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    /// Deterministic id, e.g. `router1-proposed-change-42`.
    pub id: String,
    pub device: String,
    pub expected_checksum: String,
    pub state: DeviceState,
    pub updated_at: DateTime<Utc>,
}

impl ChildRecord {
    pub fn new(
        id: impl Into<String>,
        device: impl Into<String>,
        expected_checksum: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device: device.into(),
            expected_checksum: expected_checksum.into(),
            state: DeviceState::PollingArtifact,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub request: RolloutRequest,
    pub state: CoordinatorState,
    /// Devices to roll out, fixed once the diff is computed.
    #[serde(default)]
    pub diff: Vec<BranchDiffEntry>,
    #[serde(default)]
    pub readiness: ReadinessSet,
    /// When the readiness barrier was first entered; the barrier deadline
    /// is measured from here so it survives restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_since: Option<DateTime<Utc>>,
    /// Dispatched device processes keyed by child id.
    #[serde(default)]
    pub children: BTreeMap<String, ChildRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(request: RolloutRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.run_id(),
            request,
            state: CoordinatorState::Init,
            diff: Vec::new(),
            readiness: ReadinessSet::new(),
            awaiting_since: None,
            children: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this run listens for readiness signals.
    pub fn accepts_signals(&self) -> bool {
        matches!(self.request, RolloutRequest::ProposedChange { .. })
    }

    /// Record a readiness signal. Returns `false` if it was already known.
    pub fn observe(&mut self, signal: &ReadinessSignal) -> bool {
        self.readiness.insert(signal.key())
    }
}

// ---------------------------------------------------------------------------
// SignalEntry
// ---------------------------------------------------------------------------

/// A readiness signal as kept in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    pub id: uuid::Uuid,
    pub signal: ReadinessSignal,
    pub received_at: DateTime<Utc>,
}

impl SignalEntry {
    pub fn new(signal: ReadinessSignal) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            signal,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!CoordinatorState::AwaitingReadiness.is_terminal());
        assert!(CoordinatorState::Failed {
            reason: "x".into()
        }
        .is_terminal());
        assert!(DeviceState::Done {
            diff: ConfigDiff::new()
        }
        .is_terminal());
        assert!(!DeviceState::Applying {
            document: serde_json::json!({})
        }
        .is_terminal());
    }

    #[test]
    fn record_state_serializes_tagged() {
        let record = RunRecord::new(RolloutRequest::Portkey {
            target_id: "R1".into(),
            checksum: "c2".into(),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "portkey-R1");
        assert_eq!(json["state"]["state"], "init");
        assert!(!record.accepts_signals());
    }

    #[test]
    fn observe_is_idempotent() {
        let mut record = RunRecord::new(RolloutRequest::ProposedChange {
            proposed_change_id: "1".into(),
            branch: "b".into(),
        });
        let signal = ReadinessSignal {
            target_id: "R1".into(),
            checksum: "c2".into(),
        };
        assert!(record.observe(&signal));
        assert!(!record.observe(&signal));
        assert_eq!(record.readiness.len(), 1);
    }
}
