use std::sync::Arc;

use axum::{Router, routing::post};

use crate::{app_state::AppState, handlers::webhook};

pub fn create_webhook_router(path: &str) -> Router<Arc<AppState>> {
    Router::new().route(path, post(webhook::receive))
}
