//! Request and response bodies of the admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    follow::{DesiredFollow, FollowKind},
    subscription::RemoteSubscription,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRequest {
    #[serde(default)]
    pub owner_scope: Option<String>,
    pub destination: String,
    pub entity_name: String,
    pub kind: FollowKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfollowRequest {
    pub destination: String,
    pub entity_name: String,
    pub kind: FollowKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowView {
    pub owner_scope: String,
    pub destination: String,
    pub entity_name: String,
    pub entity_id: String,
    pub kind: FollowKind,
    pub created_at: DateTime<Utc>,
    /// Present when the follow was accepted but the push subscription could
    /// not be established yet; the next sweep retries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<DesiredFollow> for FollowView {
    fn from(follow: DesiredFollow) -> Self {
        Self {
            owner_scope: follow.owner_scope,
            destination: follow.destination,
            entity_name: follow.entity_name,
            entity_id: follow.entity_id,
            kind: follow.kind,
            created_at: follow.created_at,
            warning: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowListResponse {
    pub destination: String,
    pub follows: Vec<FollowView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub follows: u64,
    pub checkpoints: u64,
    pub deliveries: u64,
    pub subscriptions: Vec<RemoteSubscription>,
}

/// Outcome counters of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub adopted: u32,
    pub created: u32,
    pub orphans_deleted: u32,
    pub duplicates_deleted: u32,
    pub stale_removed: u32,
    pub unsubscribed: u32,
    pub failed_entities: u32,
}

impl SweepReport {
    pub const fn changes(&self) -> u32 {
        self.adopted
            + self.created
            + self.orphans_deleted
            + self.duplicates_deleted
            + self.stale_removed
            + self.unsubscribed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the process started.
    pub uptime: u64,
}
