//! Inbound webhooks from the source-of-truth store.
//!
//! Payloads arrive as `{"data": {...}}`. Handlers acknowledge as soon as the
//! run is recorded; they never wait for a rollout to finish.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Deserializer};
use tracing::info;

use rollout_core::types::{ReadinessSignal, RolloutRequest};

use crate::error::AppError;
use crate::state::AppState;

/// Identifiers are strings, but some emitters send numeric ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerData {
    #[serde(default, deserialize_with = "string_or_number")]
    pub proposed_change_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerPayload {
    #[serde(default)]
    pub data: TriggerData,
    /// Older emitters put the branch beside `data`.
    #[serde(default)]
    pub branch: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::bad_request(format!("missing field 'data.{field}'"))),
    }
}

fn started(run_id: &str) -> Json<String> {
    Json(format!("Workflow {run_id} started."))
}

/// POST /proposed_change_workflow: roll out every device changed on a branch.
pub async fn proposed_change_workflow(
    State(app): State<AppState>,
    Json(payload): Json<TriggerPayload>,
) -> Result<Json<String>, AppError> {
    let branch = payload.data.branch.or(payload.branch);
    let request = RolloutRequest::ProposedChange {
        proposed_change_id: required(payload.data.proposed_change_id, "proposed_change_id")?,
        branch: required(branch, "branch")?,
    };
    let ack = app.engine.start(request).await?;
    Ok(started(&ack.run_id))
}

/// POST /portkey_workflow: push one device's artifact immediately.
pub async fn portkey_workflow(
    State(app): State<AppState>,
    Json(payload): Json<TriggerPayload>,
) -> Result<Json<String>, AppError> {
    let request = RolloutRequest::Portkey {
        target_id: required(payload.data.target_id, "target_id")?,
        checksum: required(payload.data.checksum, "checksum")?,
    };
    let ack = app.engine.start(request).await?;
    Ok(started(&ack.run_id))
}

/// POST /artifact_updated: a render finished; wake any run waiting on it.
pub async fn artifact_updated(
    State(app): State<AppState>,
    Json(payload): Json<TriggerPayload>,
) -> Result<Json<String>, AppError> {
    let signal = ReadinessSignal {
        target_id: required(payload.data.target_id, "target_id")?,
        checksum: required(payload.data.checksum, "checksum")?,
    };
    let receipt = app.engine.signal(signal).await?;
    if receipt.delivered.is_empty() {
        info!("no running proposed-change runs to signal");
    }
    Ok(Json(format!(
        "Signalled {} running workflows",
        receipt.delivered.len()
    )))
}
