use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message posted to a destination for a specific item.
///
/// At most one record exists per `(item_id, destination)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub item_id: String,
    pub destination: String,
    pub message_handle: String,
    pub entity_name: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}
