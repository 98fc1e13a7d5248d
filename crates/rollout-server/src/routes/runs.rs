use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use rollout_core::engine::RunRecord;

use crate::error::AppError;
use crate::state::AppState;

/// One row of `GET /api/runs`.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub kind: &'static str,
    pub state: &'static str,
    pub devices: usize,
    pub live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSummary {
    fn from_record(record: &RunRecord, live: bool) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.request.kind(),
            state: record.state.as_str(),
            devices: record.children.len().max(record.diff.len()),
            live,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// GET /api/runs: every recorded run, newest first.
pub async fn list_runs(State(app): State<AppState>) -> Result<Json<Vec<RunSummary>>, AppError> {
    let live = app.engine.live_runs().await;
    let runs = app.engine.runs()?;
    Ok(Json(
        runs.iter()
            .map(|r| RunSummary::from_record(r, live.contains(&r.id)))
            .collect(),
    ))
}

/// GET /api/runs/{id}: the full recorded progress of one run.
pub async fn get_run(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = app.engine.run(&id)?;
    let mut body = serde_json::to_value(&record)?;
    body["live"] = serde_json::Value::Bool(app.engine.is_live(&id).await);
    Ok(Json(body))
}
