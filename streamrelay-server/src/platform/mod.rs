//! Client side of the streaming platform: push subscriptions, entity lookups
//! and the app credential used to authenticate them.

pub mod credentials;
pub mod helix;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use shared::models::{Clip, EventKind, PlatformUser, StreamInfo, SubscriptionDescriptor};
use thiserror::Error;

pub use credentials::{CredentialManager, OAuthTokenSource, TokenSource};
pub use helix::HelixClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform rejected the credential")]
    Unauthorized,
    #[error("subscription already exists on the platform")]
    Conflict,
    #[error("resource does not exist on the platform")]
    NotFound,
    #[error("transient platform failure: {0}")]
    Transient(String),
    #[error("platform rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected platform response: {0}")]
    Decode(String),
    #[error("credential grant failed: {0}")]
    Grant(String),
}

impl PlatformError {
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::CONFLICT => Self::Conflict,
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::TOO_MANY_REQUESTS => Self::Transient(format!("rate limited: {}", message.into())),
            status if status.is_server_error() => {
                Self::Transient(format!("status {status}: {}", message.into()))
            }
            status => Self::Rejected {
                status: status.as_u16(),
                message: message.into(),
            },
        }
    }

    /// HTTP status behind the failure, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Conflict => Some(409),
            Self::NotFound => Some(404),
            Self::Rejected { status, .. } => Some(*status),
            Self::Transient(_) | Self::Decode(_) | Self::Grant(_) => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Operations the relay needs from the streaming platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Registers a webhook push subscription for `entity_id` pointing at this
    /// deployment's callback.
    async fn create_subscription(
        &self,
        kind: EventKind,
        entity_id: &str,
    ) -> PlatformResult<SubscriptionDescriptor>;
    async fn delete_subscription(&self, subscription_id: &str) -> PlatformResult<()>;
    /// Every subscription held by the app, across all pages.
    async fn list_subscriptions(&self) -> PlatformResult<Vec<SubscriptionDescriptor>>;
    async fn get_user_by_name(&self, login: &str) -> PlatformResult<Option<PlatformUser>>;
    async fn get_user_by_id(&self, user_id: &str) -> PlatformResult<Option<PlatformUser>>;
    /// `None` when the user is not live.
    async fn get_stream(&self, user_id: &str) -> PlatformResult<Option<StreamInfo>>;
    async fn get_follower_count(&self, user_id: &str) -> PlatformResult<u64>;
    /// Clips created at or after `started_at`.
    async fn get_clips(
        &self,
        broadcaster_id: &str,
        started_at: DateTime<Utc>,
    ) -> PlatformResult<Vec<Clip>>;
    async fn get_clip(&self, clip_id: &str) -> PlatformResult<Option<Clip>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        assert_eq!(
            PlatformError::from_status(StatusCode::CONFLICT, "dup"),
            PlatformError::Conflict
        );
        assert!(PlatformError::from_status(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(PlatformError::from_status(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert_eq!(
            PlatformError::from_status(StatusCode::BAD_REQUEST, "bad").status(),
            Some(400)
        );
        assert_eq!(PlatformError::Transient("timeout".into()).status(), None);
    }
}
