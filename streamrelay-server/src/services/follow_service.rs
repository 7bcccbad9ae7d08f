use std::sync::Arc;

use chrono::Utc;
use shared::models::{
    DesiredFollow, FollowKind, FollowListResponse, FollowRequest, FollowView, StatusResponse,
    UnfollowRequest,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::reconciler::{EntitySync, ReconcileError, Reconciler, SubscribeOutcome};
use crate::{
    db::store::{Store, StoreError},
    platform::{PlatformApi, PlatformError},
};

pub const DEFAULT_OWNER_SCOPE: &str = "default";

const MAX_ENTITY_NAME_LEN: usize = 25;

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("'{0}' is not a valid channel name")]
    InvalidName(String),
    #[error("destination must not be empty")]
    InvalidDestination,
    #[error("no platform user named '{0}'")]
    UnknownEntity(String),
    #[error("{destination} already follows {entity_name} ({kind})")]
    AlreadyFollowing {
        destination: String,
        entity_name: String,
        kind: FollowKind,
    },
    #[error("{destination} does not follow {entity_name} ({kind})")]
    NotFollowing {
        destination: String,
        entity_name: String,
        kind: FollowKind,
    },
    /// The follow change is committed; only the subscription update failed.
    #[error("subscription update failed: {0}")]
    Subscription(#[source] ReconcileError),
    #[error("platform lookup failed: {0}")]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type FollowResult<T> = Result<T, FollowError>;

/// Lowercases and validates a channel name: 1 to 25 of `[a-z0-9_]`.
pub fn normalize_entity_name(raw: &str) -> FollowResult<String> {
    let name = raw.trim().to_lowercase();
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid_chars && (1..=MAX_ENTITY_NAME_LEN).contains(&name.len()) {
        Ok(name)
    } else {
        Err(FollowError::InvalidName(raw.to_string()))
    }
}

fn normalize_destination(raw: &str) -> FollowResult<String> {
    let destination = raw.trim();
    if destination.is_empty() {
        Err(FollowError::InvalidDestination)
    } else {
        Ok(destination.to_string())
    }
}

/// Operator-facing follow management.
pub struct FollowService {
    store: Arc<dyn Store>,
    platform: Arc<dyn PlatformApi>,
    reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for FollowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowService").finish_non_exhaustive()
    }
}

impl FollowService {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformApi>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            store,
            platform,
            reconciler,
        }
    }

    #[instrument(skip(self, request), fields(destination = %request.destination, entity = %request.entity_name, kind = %request.kind))]
    pub async fn follow(&self, request: FollowRequest) -> FollowResult<FollowView> {
        let entity_name = normalize_entity_name(&request.entity_name)?;
        let destination = normalize_destination(&request.destination)?;
        let user = self
            .platform
            .get_user_by_name(&entity_name)
            .await?
            .ok_or_else(|| FollowError::UnknownEntity(entity_name.clone()))?;

        let follow = DesiredFollow {
            owner_scope: request
                .owner_scope
                .filter(|scope| !scope.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OWNER_SCOPE.to_string()),
            destination,
            entity_name: user.login.to_lowercase(),
            entity_id: user.id,
            kind: request.kind,
            created_at: Utc::now(),
        };

        match self.store.insert_follow(&follow).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(FollowError::AlreadyFollowing {
                    destination: follow.destination,
                    entity_name: follow.entity_name,
                    kind: follow.kind,
                });
            }
            Err(err) => return Err(err.into()),
        }
        info!("follow added");

        let sync = self
            .reconciler
            .reconcile_entity(&follow.entity_id, &follow.entity_name, follow.kind)
            .await
            .map_err(FollowError::Subscription)?;

        let mut view = FollowView::from(follow);
        if sync == EntitySync::Subscribed(SubscribeOutcome::Unresolved) {
            warn!("subscription conflict could not be resolved");
            view.warning = Some(
                "the platform reports an existing subscription that could not be adopted; \
                 the next reconciliation sweep will retry"
                    .into(),
            );
        }
        Ok(view)
    }

    #[instrument(skip(self, request), fields(destination = %request.destination, entity = %request.entity_name, kind = %request.kind))]
    pub async fn unfollow(&self, request: UnfollowRequest) -> FollowResult<()> {
        let entity_name = normalize_entity_name(&request.entity_name)?;
        let destination = normalize_destination(&request.destination)?;
        let Some(follow) = self
            .store
            .get_follow(&destination, &entity_name, request.kind)
            .await?
        else {
            return Err(FollowError::NotFollowing {
                destination,
                entity_name,
                kind: request.kind,
            });
        };

        self.store
            .remove_follow(&destination, &entity_name, request.kind)
            .await?;
        info!("follow removed");

        if follow.kind == FollowKind::Clips
            && self
                .store
                .count_follows(&follow.entity_id, FollowKind::Clips)
                .await?
                == 0
        {
            self.store.remove_checkpoint(&entity_name).await?;
        }

        self.reconciler
            .reconcile_entity(&follow.entity_id, &entity_name, follow.kind)
            .await
            .map_err(FollowError::Subscription)?;
        Ok(())
    }

    pub async fn list(&self, destination: &str) -> FollowResult<FollowListResponse> {
        let destination = normalize_destination(destination)?;
        let follows = self
            .store
            .follows_for_destination(&destination)
            .await?
            .into_iter()
            .map(FollowView::from)
            .collect();
        Ok(FollowListResponse {
            destination,
            follows,
        })
    }

    pub async fn status(&self) -> FollowResult<StatusResponse> {
        let stats = self.store.stats().await?;
        let subscriptions = self.store.list_subscriptions().await?;
        Ok(StatusResponse {
            follows: stats.follows,
            checkpoints: stats.checkpoints,
            deliveries: stats.deliveries,
            subscriptions,
        })
    }
}
