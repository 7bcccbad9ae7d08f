use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::subscription::EventKind;

/// Which kind of events a destination wants for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowKind {
    Live,
    Clips,
}

impl FollowKind {
    pub const ALL: [Self; 2] = [Self::Live, Self::Clips];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Clips => "clips",
        }
    }

    /// The push subscription that must exist while at least one follow of
    /// this kind targets an entity.
    ///
    /// Clip creation has no push channel and is discovered by polling; the
    /// push subscription for clips only reports deletions.
    pub const fn required_event_kind(self) -> EventKind {
        match self {
            Self::Live => EventKind::StreamOnline,
            Self::Clips => EventKind::ClipDelete,
        }
    }
}

impl fmt::Display for FollowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown follow kind: {0}")]
pub struct ParseFollowKindError(pub String);

impl FromStr for FollowKind {
    type Err = ParseFollowKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "clips" | "clip" => Ok(Self::Clips),
            other => Err(ParseFollowKindError(other.to_string())),
        }
    }
}

/// An operator's declared intent to receive an entity's events at a destination.
///
/// Unique per `(destination, entity_name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredFollow {
    pub owner_scope: String,
    pub destination: String,
    /// Lowercased login name of the followed account.
    pub entity_name: String,
    /// Platform user id resolved when the follow was created.
    pub entity_id: String,
    pub kind: FollowKind,
    pub created_at: DateTime<Utc>,
}
