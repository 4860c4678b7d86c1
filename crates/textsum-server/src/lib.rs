//! HTTP prediction service.
//!
//! Serves summaries from a [`PredictionPipeline`](textsum_training::PredictionPipeline) loaded in
//! the background and accepts training requests that run on the in-process
//! [`TrainingQueue`](textsum_training::TrainingQueue).

pub mod error;
pub mod handlers;
pub mod state;

pub use error::ApiError;
pub use state::{AppState, ModelState};

use axum::http::StatusCode;
use axum::middleware::map_response;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Listener and request-handling settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on summaries generated at the same time.
    pub max_concurrent_predictions: usize,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_concurrent_predictions: 2,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builds the application router with CORS, tracing, request ids and a request timeout.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/docs", get(handlers::docs))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/predict", post(handlers::predict))
        .route("/train", post(handlers::train).get(handlers::list_jobs))
        .route("/train/:job_id", get(handlers::job_status).delete(handlers::cancel_job))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(map_response(timeout_body))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Gives the bare 408 from the timeout layer the same `{"error"}` body as handler errors.
async fn timeout_body(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT {
        return ApiError::Timeout("Request timed out".to_string()).into_response();
    }
    response
}

/// Binds `config.bind_address()` and serves until Ctrl-C.
pub async fn serve(state: AppState, config: &ServerConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(address = %listener.local_addr()?, "Prediction service listening");
    axum::serve(listener, build_router(state, config))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down prediction service");
}
