use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use relay_core::config::GatewayConfig;
use relay_engine::Crew;

use crate::routes;
use crate::state::AppState;

/// The gateway routes over `state`, without binding a listener.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/execute", post(routes::execute))
        .route("/api/stream", post(routes::stream))
        .route("/api/metrics", get(routes::metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP + SSE gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    crew: Arc<Crew>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, crew: Arc<Crew>) -> Self {
        Self { config, crew }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            crew: self.crew.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, workflow = %self.crew.settings().name, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
