use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use shared::models::{
    FollowListResponse, FollowRequest, FollowView, StatusResponse, SweepReport, UnfollowRequest,
};
use tracing::info;

use crate::{
    app_state::AppState,
    http::{ApiError, AppResult},
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub destination: String,
}

pub async fn create_follow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FollowRequest>,
) -> AppResult<(StatusCode, Json<FollowView>)> {
    let view = state.follows.follow(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn delete_follow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnfollowRequest>,
) -> AppResult<StatusCode> {
    state.follows.unfollow(request).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_follows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<FollowListResponse>> {
    if query.destination.trim().is_empty() {
        return Err(ApiError::bad_request("destination is required"));
    }
    Ok(Json(state.follows.list(&query.destination).await?))
}

pub async fn status(State(state): State<Arc<AppState>>) -> AppResult<Json<StatusResponse>> {
    Ok(Json(state.follows.status().await?))
}

/// Runs a full reconciliation sweep on demand.
pub async fn reconcile(State(state): State<Arc<AppState>>) -> AppResult<Json<SweepReport>> {
    let report = state.reconciler.sweep().await?;
    info!(changes = report.changes(), "manual sweep finished");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use crate::{
        middleware::auth::AdminToken,
        routes::admin::create_admin_router,
        test_support::{CALLBACK_URL, TestApp, test_app_with},
    };
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::{Value, json};
    use shared::{
        config::server::{Config, Profile},
        models::EventKind,
    };
    use tower::ServiceExt;

    const TOKEN: &str = "admin-secret";

    async fn admin_app() -> TestApp {
        let mut config = Config::default_for_profile(Profile::Test);
        config.server.admin_token = TOKEN.into();
        let app = test_app_with(config).await;
        app.platform.add_user("1337", "streamer");
        app
    }

    fn router(app: &TestApp) -> Router {
        Router::new()
            .nest("/api", create_admin_router(AdminToken::new(TOKEN)))
            .with_state(app.state.clone())
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn follow_body(destination: &str, name: &str, kind: &str) -> Value {
        json!({ "destination": destination, "entity_name": name, "kind": kind })
    }

    #[tokio::test]
    async fn follow_creates_the_subscription() {
        let app = admin_app().await;
        let response = router(&app)
            .oneshot(request(
                "POST",
                "/api/follows",
                Some(follow_body("chan-a", "Streamer", "live")),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["entity_name"], "streamer");
        assert_eq!(body["entity_id"], "1337");
        assert_eq!(app.platform.remote_for("1337", EventKind::StreamOnline).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_follow_conflicts() {
        let app = admin_app().await;
        let body = follow_body("chan-a", "streamer", "live");
        router(&app)
            .oneshot(request("POST", "/api/follows", Some(body.clone())))
            .await
            .unwrap();

        let response = router(&app)
            .oneshot(request("POST", "/api/follows", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "conflict");
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let app = admin_app().await;
        let response = router(&app)
            .oneshot(request(
                "POST",
                "/api/follows",
                Some(follow_body("chan-a", "nobody", "clips")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unfollow_removes_the_last_subscription() {
        let app = admin_app().await;
        router(&app)
            .oneshot(request(
                "POST",
                "/api/follows",
                Some(follow_body("chan-a", "streamer", "live")),
            ))
            .await
            .unwrap();

        let response = router(&app)
            .oneshot(request(
                "DELETE",
                "/api/follows",
                Some(follow_body("chan-a", "streamer", "live")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(app.platform.remote_for("1337", EventKind::StreamOnline).is_empty());

        let again = router(&app)
            .oneshot(request(
                "DELETE",
                "/api/follows",
                Some(follow_body("chan-a", "streamer", "live")),
            ))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_returns_follows_of_a_destination() {
        let app = admin_app().await;
        for kind in ["live", "clips"] {
            router(&app)
                .oneshot(request(
                    "POST",
                    "/api/follows",
                    Some(follow_body("chan-a", "streamer", kind)),
                ))
                .await
                .unwrap();
        }

        let response = router(&app)
            .oneshot(request("GET", "/api/follows?destination=chan-a", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["follows"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn reconcile_reports_sweep_counters() {
        let app = admin_app().await;
        app.platform.seed_subscription(
            "orphan",
            EventKind::StreamOnline,
            "4242",
            CALLBACK_URL,
            "enabled",
        );

        let response = router(&app)
            .oneshot(request("POST", "/api/reconcile", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["orphans_deleted"], 1);
        assert!(app.platform.remote_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn status_counts_follows() {
        let app = admin_app().await;
        router(&app)
            .oneshot(request(
                "POST",
                "/api/follows",
                Some(follow_body("chan-a", "streamer", "live")),
            ))
            .await
            .unwrap();

        let response = router(&app)
            .oneshot(request("GET", "/api/status", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["follows"], 1);
        assert_eq!(body["subscriptions"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn requests_without_the_token_are_unauthorized() {
        let app = admin_app().await;
        let response = router(&app)
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
