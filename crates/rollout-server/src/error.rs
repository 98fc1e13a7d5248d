use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rollout_core::RolloutError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 Bad Request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(RolloutError::InvalidRequest(msg.into()).into())
    }
}

fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::InvalidRequest(_) | RolloutError::Config(_) => StatusCode::BAD_REQUEST,
        RolloutError::RunNotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::RunActive(_) => StatusCode::CONFLICT,
        RolloutError::Store(_) | RolloutError::RetriesExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RolloutError::Decode { .. }
        | RolloutError::Apply { .. }
        | RolloutError::ActivityTimeout { .. }
        | RolloutError::ReadinessTimeout { .. }
        | RolloutError::DuplicateDevice { .. }
        | RolloutError::DeviceFailed { .. }
        | RolloutError::GatherFailure { .. }
        | RolloutError::Interrupted(_)
        | RolloutError::RunDb(_)
        | RolloutError::Io(_)
        | RolloutError::Yaml(_)
        | RolloutError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<RolloutError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
