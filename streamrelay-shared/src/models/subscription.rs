use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::follow::FollowKind;

/// Push event kinds the relay subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "stream.online")]
    StreamOnline,
    #[serde(rename = "channel.clip.delete")]
    ClipDelete,
}

impl EventKind {
    pub const ALL: [Self; 2] = [Self::StreamOnline, Self::ClipDelete];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StreamOnline => "stream.online",
            Self::ClipDelete => "channel.clip.delete",
        }
    }

    /// The follow kind whose followers require this subscription.
    pub const fn follow_kind(self) -> FollowKind {
        match self {
            Self::StreamOnline => FollowKind::Live,
            Self::ClipDelete => FollowKind::Clips,
        }
    }

    /// Subscription version to request when creating it remotely.
    pub const fn version(self) -> &'static str {
        "1"
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported event kind: {0}")]
pub struct ParseEventKindError(pub String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream.online" => Ok(Self::StreamOnline),
            "channel.clip.delete" => Ok(Self::ClipDelete),
            other => Err(ParseEventKindError(other.to_string())),
        }
    }
}

/// Coarse lifecycle state of a remote subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Enabled,
    Pending,
    Revoked,
}

impl SubscriptionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Pending => "pending",
            Self::Revoked => "revoked",
        }
    }

    /// Maps a raw platform status string onto the three states the relay
    /// tracks. Anything that is neither enabled nor awaiting verification is
    /// treated as dead.
    pub fn from_remote(raw: &str) -> Self {
        match raw {
            "enabled" => Self::Enabled,
            "pending" | "webhook_callback_verification_pending" => Self::Pending,
            _ => Self::Revoked,
        }
    }

    pub const fn is_live(self) -> bool {
        matches!(self, Self::Enabled | Self::Pending)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local mirror of a push subscription held by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub subscription_id: String,
    pub entity_name: String,
    pub entity_id: String,
    pub event_kind: EventKind,
    pub status: SubscriptionStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_remote("enabled"),
            SubscriptionStatus::Enabled
        );
        assert_eq!(
            SubscriptionStatus::from_remote("webhook_callback_verification_pending"),
            SubscriptionStatus::Pending
        );
        assert_eq!(
            SubscriptionStatus::from_remote("authorization_revoked"),
            SubscriptionStatus::Revoked
        );
        assert!(!SubscriptionStatus::Revoked.is_live());
    }

    #[test]
    fn event_kind_round_trips_through_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
            assert_eq!(kind.follow_kind().required_event_kind(), kind);
        }
        assert!("channel.follow".parse::<EventKind>().is_err());
    }
}
