use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use chrono::Utc;
use serde_json::json;
use shared::models::HealthResponse;
use tracing::warn;

use crate::{app_state::AppState, db::bootstrap};

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "health", "status" => "ok")
        .increment(1);
    Json(HealthResponse {
        status: "ok".into(),
        timestamp: Utc::now(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match bootstrap::ensure_readiness(&state.pool).await {
        Ok(()) => {
            metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => "ok")
                .increment(1);
            (StatusCode::OK, Json(json!({ "status": "ready" })))
        }
        Err(err) => {
            warn!(error = %err, "readiness check failed");
            metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => "error")
                .increment(1);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            )
        }
    }
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
}
