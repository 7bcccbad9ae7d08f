use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::follows,
    middleware::auth::{AdminToken, require_admin_token},
};

/// Operator API, nested under `/api` and guarded by the admin bearer token.
pub fn create_admin_router(token: AdminToken) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/follows",
            get(follows::list_follows)
                .post(follows::create_follow)
                .delete(follows::delete_follow),
        )
        .route("/status", get(follows::status))
        .route("/reconcile", post(follows::reconcile))
        .route_layer(middleware::from_fn_with_state(token, require_admin_token))
}
