//! HTTP surface: `POST /?model=<name>` plus status routes.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use runmodel_core::{health_routes, HealthState};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::Error;
use crate::metrics::PredictionMetrics;
use crate::prediction::Prediction;
use crate::registry::{ModelRegistry, ModelStatus};

#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelRegistry>,
    pub metrics: PredictionMetrics,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelQuery {
    #[serde(default)]
    pub model: String,
}

/// Builds the full router. Prediction metrics are registered on `prom`,
/// which is also what `/metrics` serves.
pub fn app(models: Arc<ModelRegistry>, health: Arc<HealthState>, prom: prometheus::Registry) -> prometheus::Result<Router> {
    let metrics = PredictionMetrics::register(&prom)?;
    let state = AppState { models, metrics };
    Ok(Router::new()
        .route("/", post(predict))
        .route("/models", get(list_models))
        .with_state(state)
        .merge(health_routes(health, prom)))
}

async fn predict(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let model = query.model;
    let pool = state.models.lookup(&model).map_err(|e| ApiError::new(&model, e))?;

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(&model, Error::MalformedBody(e.to_string())))?;
    let work = Prediction::from_json(value).map_err(|e| ApiError::new(&model, e))?;
    let kind = work.kind();
    let len = work.len();

    let started = Instant::now();
    let result = pool.submit(work).await;
    let elapsed = started.elapsed();
    match result {
        Ok(output) => {
            state.metrics.observe(&model, kind, "ok", elapsed);
            info!(model = %model, kind, len, elapsed_ms = elapsed.as_millis() as u64, "prediction served");
            Ok(Json(output.into_json()))
        }
        Err(e) => {
            state.metrics.observe(&model, kind, "error", elapsed);
            warn!(model = %model, kind, len, error = %e, "prediction failed");
            Err(ApiError::new(&model, e.into()))
        }
    }
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelStatus>> {
    Json(state.models.statuses())
}

/// An [`Error`] tied to the model the request asked for.
#[derive(Debug)]
pub struct ApiError {
    model: String,
    error: Error,
}

impl ApiError {
    pub fn new(model: &str, error: Error) -> Self { Self { model: model.to_string(), error } }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Configuration(_) | Error::Execution(_) | Error::Load(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({"error": self.error.to_string(), "model": self.model}))).into_response()
    }
}
