//! Status API for operators
//!
//! A small read-mostly HTTP surface over a running relay: confirmed target
//! states, queue statistics and dead letters, plus redrive of dead letters.
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Liveness and queue backend health
//! - `GET /api/v1/targets` - Confirmed state of every target
//! - `GET /api/v1/targets/:id/state` - Confirmed state of one target
//! - `GET /api/v1/dispatch/stats` - Queue statistics
//! - `GET /api/v1/dispatch/dead-letters` - Entries that gave up
//! - `POST /api/v1/dispatch/dead-letters/:id/redrive` - Retry a dead letter

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{
    DeadLettersResponse, HealthResponse, RedriveResponse, TargetStateResponse, TargetsResponse,
};

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiSettings;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "127.0.0.1:8080")
    pub bind_addr: SocketAddr,

    /// Optional bearer token required on every request
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token: None,
            enable_cors: true,
        }
    }
}

impl From<ApiSettings> for ApiConfig {
    fn from(settings: ApiSettings) -> Self {
        Self {
            bind_addr: settings.bind_addr,
            auth_token: settings.auth_token,
            enable_cors: settings.enable_cors,
        }
    }
}

/// Build the router with all routes and layers
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/targets", get(routes::targets::list_targets))
        .route(
            "/api/v1/targets/:id/state",
            get(routes::targets::get_target_state),
        )
        .route("/api/v1/dispatch/stats", get(routes::dispatch::get_stats))
        .route(
            "/api/v1/dispatch/dead-letters",
            get(routes::dispatch::list_dead_letters),
        )
        .route(
            "/api/v1/dispatch/dead-letters/:id/redrive",
            post(routes::dispatch::redrive_dead_letter),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
