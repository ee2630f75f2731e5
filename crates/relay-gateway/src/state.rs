use std::sync::Arc;

use relay_core::config::GatewayConfig;
use relay_engine::Crew;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub crew: Arc<Crew>,
}
