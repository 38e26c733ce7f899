use std::sync::Arc;

use flowforge_core::config::GatewayConfig;
use flowforge_core::traits::{GraphStore, RunStore};
use flowforge_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Engine,
    pub runs: Arc<dyn RunStore>,
    pub graphs: Arc<dyn GraphStore>,
}
