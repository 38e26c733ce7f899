use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

/// All API routes over the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Validation
        .route("/api/validate", post(routes::validate_graph))
        .route("/api/connections/validate", post(routes::validate_connection))
        // Saved graphs
        .route(
            "/api/projects/{id}/graph",
            get(routes::get_graph).put(routes::save_graph),
        )
        .route("/api/projects/{id}/runs", post(routes::run_project))
        // Runs
        .route("/api/runs", post(routes::submit_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/events", get(routes::run_events))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    ///
    /// On shutdown every active run is canceled so open progress streams
    /// reach their closing event and the server can drain.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let bind = self.state.config.bind.clone();
        let app = build_router(self.state.clone());

        let listener = TcpListener::bind(&bind).await?;
        info!(bind = %bind, "Gateway listening");

        let engine = self.state.engine.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                for run_id in engine.active_runs() {
                    engine.cancel(&run_id);
                }
            })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
