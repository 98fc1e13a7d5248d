pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use rollout_core::Engine;
use std::future::Future;
use tower_http::trace::TraceLayer;

/// Build the axum Router with all trigger and query routes.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(engine: Engine) -> Router {
    let app_state = state::AppState::new(engine);

    Router::new()
        // Triggers
        .route(
            "/proposed_change_workflow",
            post(routes::triggers::proposed_change_workflow),
        )
        .route(
            "/portkey_workflow",
            post(routes::triggers::portkey_workflow),
        )
        .route(
            "/artifact_updated",
            post(routes::triggers::artifact_updated),
        )
        // Runs
        .route("/api/runs", get(routes::runs::list_runs))
        .route("/api/runs/{id}", get(routes::runs::get_run))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve on a pre-bound listener until `shutdown` resolves, then suspend
/// every live run so the next start can recover it.
///
/// Taking a bound listener lets the caller read the actual port first
/// (useful when binding port 0).
pub async fn serve_on<F>(
    engine: Engine,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let app = build_router(engine.clone());

    tracing::info!("rollout server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    engine.shutdown().await;
    tracing::info!("rollout server stopped");
    Ok(())
}
