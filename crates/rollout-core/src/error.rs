use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fault reported by a device management channel during an apply.
///
/// Connection and timeout faults are worth retrying; a device that rejects
/// the document or refuses the credentials will answer the same way on the
/// next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ApplyFault {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rejected by device: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ApplyFault {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("artifact store error: {0}")]
    Store(String),

    #[error("failed to decode artifact '{storage_id}': {reason}")]
    Decode { storage_id: String, reason: String },

    #[error("apply to '{device}' failed: {fault}")]
    Apply { device: String, fault: ApplyFault },

    #[error("activity '{activity}' exceeded its start-to-close timeout of {timeout_secs}s")]
    ActivityTimeout { activity: String, timeout_secs: u64 },

    #[error("activity '{activity}' gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        activity: String,
        attempts: u32,
        last: String,
    },

    #[error("run '{run_id}' timed out waiting for artifacts: {}", missing.join(", "))]
    ReadinessTimeout { run_id: String, missing: Vec<String> },

    #[error("device '{device}' has more than one changed artifact: {}", checksums.join(", "))]
    DuplicateDevice {
        device: String,
        checksums: Vec<String>,
    },

    #[error("device '{device}' failed: {reason}")]
    DeviceFailed { device: String, reason: String },

    #[error("device process '{child_id}' failed: {reason}")]
    GatherFailure { child_id: String, reason: String },

    #[error("run already active: {0}")]
    RunActive(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run interrupted: {0}")]
    Interrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("run database error: {0}")]
    RunDb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RolloutError {
    /// Whether an activity that failed with this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) | Self::ActivityTimeout { .. } | Self::Io(_) => true,
            Self::Apply { fault, .. } => fault.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_faults_are_retryable() {
        assert!(RolloutError::Store("connection reset".into()).is_retryable());
        assert!(RolloutError::Apply {
            device: "leaf1".into(),
            fault: ApplyFault::Timeout("deadline".into()),
        }
        .is_retryable());
    }

    #[test]
    fn device_rejections_are_not_retryable() {
        for fault in [
            ApplyFault::Auth("bad password".into()),
            ApplyFault::Rejected("invalid leaf".into()),
            ApplyFault::Protocol("unexpected body".into()),
        ] {
            let err = RolloutError::Apply {
                device: "leaf1".into(),
                fault,
            };
            assert!(!err.is_retryable(), "{err} should not be retried");
        }
    }

    #[test]
    fn readiness_timeout_lists_missing_keys() {
        let err = RolloutError::ReadinessTimeout {
            run_id: "proposed-change-7".into(),
            missing: vec!["R1@c2".into(), "R2@c9".into()],
        };
        assert_eq!(
            err.to_string(),
            "run 'proposed-change-7' timed out waiting for artifacts: R1@c2, R2@c9"
        );
    }

    #[test]
    fn duplicate_device_names_every_checksum() {
        let err = RolloutError::DuplicateDevice {
            device: "router1".into(),
            checksums: vec!["R1@cA".into(), "R1@cB".into()],
        };
        assert_eq!(
            err.to_string(),
            "device 'router1' has more than one changed artifact: R1@cA, R1@cB"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn apply_fault_serializes_tagged() {
        let json = serde_json::to_value(ApplyFault::Rejected("bad".into())).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["message"], "bad");
    }
}
