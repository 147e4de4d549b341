//! HTTP front end for handwritten text recognition.
//!
//! Serves `POST /predict`, `GET /health` and `GET /` on top of a shared
//! [HtrEngine].

mod config;
mod handlers;
mod types;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use scrawl::HtrEngine;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{ServerConfig, DEFAULT_ADDR, DEFAULT_MAX_BODY_BYTES};
pub use handlers::*;
pub use types::*;

/// API server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Recognition engine, loaded once at startup.
    pub engine: Arc<HtrEngine>,
}

impl AppState {
    pub fn new(engine: HtrEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/predict", post(predict))
        // Middleware
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server and run until a shutdown signal is received.
pub async fn start_server(
    addr: &str,
    state: AppState,
    max_body_bytes: usize,
) -> Result<(), std::io::Error> {
    let app = build_router(state, max_body_bytes);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        },
    }
}
