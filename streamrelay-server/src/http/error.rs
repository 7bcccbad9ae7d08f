use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::{
    db::store::StoreError,
    services::{FollowError, reconciler::ReconcileError},
};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn bad_gateway(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal_server_error(value.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or_else(|| std::borrow::Cow::Borrowed("unknown"));
            let message = format!("database error {code}");
            return Self::internal_server_error(message)
                .with_details(json!({ "sqlite_code": code, "message": db_err.message() }));
        }

        Self::internal_server_error(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(message) => Self::conflict(message),
            StoreError::Corrupt(message) => Self::internal_server_error(message),
            StoreError::Database(db_err) => Self::from(db_err),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Store(store) => Self::from(store),
            other => Self::bad_gateway("reconciliation_failed", other.to_string()),
        }
    }
}

impl From<FollowError> for ApiError {
    fn from(err: FollowError) -> Self {
        match err {
            FollowError::InvalidName(_) | FollowError::InvalidDestination => {
                Self::bad_request(err.to_string())
            }
            FollowError::UnknownEntity(_) | FollowError::NotFollowing { .. } => {
                Self::not_found(err.to_string())
            }
            FollowError::AlreadyFollowing { .. } => Self::conflict(err.to_string()),
            FollowError::Subscription(ref source) => {
                let details = json!({
                    "follow_saved": true,
                    "reason": source.to_string(),
                });
                Self::bad_gateway("subscription_failed", err.to_string()).with_details(details)
            }
            FollowError::Platform(_) => Self::bad_gateway("platform_unavailable", err.to_string()),
            FollowError::Store(store) => Self::from(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformError;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;
    use shared::models::FollowKind;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("missing follow")
            .with_details(json!({ "destination": "chan-a" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value = serde_json::from_slice(&bytes).expect("problem json");
        assert_eq!(json["type"], "https://streamrelay.dev/problems/not_found");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "missing follow");
        assert_eq!(json["details"]["destination"], "chan-a");
    }

    #[test]
    fn follow_errors_map_to_matching_status_codes() {
        let invalid = ApiError::from(FollowError::InvalidName("bad name".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let unknown = ApiError::from(FollowError::UnknownEntity("ghost".into()));
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let duplicate = ApiError::from(FollowError::AlreadyFollowing {
            destination: "chan-a".into(),
            entity_name: "streamer".into(),
            kind: FollowKind::Live,
        });
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let failed = ApiError::from(FollowError::Subscription(ReconcileError::Platform(
            PlatformError::Transient("timeout".into()),
        )));
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(failed.code(), "subscription_failed");
        assert!(
            failed
                .details
                .as_ref()
                .is_some_and(|details| details["follow_saved"] == Value::Bool(true))
        );
    }

    #[test]
    fn store_errors_map_to_server_errors() {
        let db = ApiError::from(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let duplicate = ApiError::from(StoreError::Duplicate("follow".into()));
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    }
}
