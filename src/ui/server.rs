//! HTTP server for the operator UI

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::error::Result;
use crate::session::SessionManager;
use crate::ui::{handlers, websocket};

/// State shared by every handler
pub struct AppState {
    pub manager: SessionManager,
    /// Identity prompts from the UI are addressed to
    pub prompt_target: String,
    pub started: Instant,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Arc<Self> {
        let prompt_target = manager.config().control.processor_identity.clone();
        Arc::new(Self {
            manager,
            prompt_target,
            started: Instant::now(),
        })
    }
}

pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/bridges", get(handlers::get_bridges))
            .route("/api/tracks", get(handlers::get_tracks))
            .route("/api/prompt", post(handlers::send_prompt))
            .route("/api/disconnect", post(handlers::disconnect))
            .route("/api/ws", get(websocket::ws_handler))
            .layer(cors)
            .with_state(state)
    }

    /// Bind and serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| crate::Error::Config(format!("invalid UI bind address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web UI listening on http://{}", listener.local_addr()?);

        axum::serve(listener, Self::router(self.state)).await?;
        Ok(())
    }

    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}
