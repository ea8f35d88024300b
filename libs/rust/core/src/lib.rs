//! Core shared utilities for runmodel processes: tracing, layered config,
//! health state and Prometheus exposition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use tracing::info;

pub mod logging;
pub mod settings;

pub use logging::{init_tracing, LogFormat, LogStream, LoggingConfig};
pub use settings::load_config;

/// Readiness of one server process. A process that can answer is live.
#[derive(Debug, Default)]
pub struct HealthState {
    ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
    pub fn mark_ready(&self) { self.ready.store(true, Ordering::SeqCst); }
    pub fn clear_ready(&self) { self.ready.store(false, Ordering::SeqCst); }
    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }
}

/// `/live`, `/ready` and `/metrics`, meant to be merged into a service router.
pub fn health_routes(health: Arc<HealthState>, metrics: prometheus::Registry) -> Router {
    let ready = health;
    Router::new()
        .route("/live", get(|| async { (StatusCode::OK, Json(serde_json::json!({"live": true}))) }))
        .route("/ready", get(move || {
            let ready = ready.clone();
            async move {
                let ok = ready.is_ready();
                let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
                (status, Json(serde_json::json!({"ready": ok})))
            }
        }))
        .route("/metrics", get(move || {
            let registry = metrics.clone();
            async move { metrics_response(&registry) }
        }))
}

/// Renders `registry` in the Prometheus text format.
pub fn metrics_response(registry: &prometheus::Registry) -> Response {
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = ?e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                tracing::warn!(error = ?e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
