//! Wire shapes of inbound push deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subscription::{EventKind, SubscriptionStatus};

/// Value of the message-type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    VerificationChallenge,
    Notification,
    Revocation,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "verification-challenge" | "webhook_callback_verification" => {
                Some(Self::VerificationChallenge)
            }
            "notification" => Some(Self::Notification),
            "revocation" => Some(Self::Revocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

/// Subscription block carried by every delivery and by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl SubscriptionDescriptor {
    pub fn event_kind(&self) -> Option<EventKind> {
        self.kind.parse().ok()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.condition.broadcaster_user_id.as_deref()
    }

    pub fn callback(&self) -> Option<&str> {
        self.transport.as_ref().and_then(|t| t.callback.as_deref())
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
            .as_deref()
            .map_or(SubscriptionStatus::Pending, SubscriptionStatus::from_remote)
    }
}

/// Body of `notification` and `revocation` deliveries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    pub subscription: SubscriptionDescriptor,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
}

/// Body of a verification delivery. Any subscription block is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerificationChallenge {
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOnlineEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub broadcaster_user_name: Option<String>,
    #[serde(default, rename = "type")]
    pub stream_type: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Category, when the platform includes it in the event.
    #[serde(default)]
    pub category_name: Option<String>,
}

impl StreamOnlineEvent {
    pub fn display_name(&self) -> &str {
        self.broadcaster_user_name
            .as_deref()
            .unwrap_or(&self.broadcaster_user_login)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipDeletedEvent {
    #[serde(alias = "clip_id")]
    pub id: String,
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
    #[serde(default)]
    pub broadcaster_user_login: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_accepts_platform_aliases() {
        assert_eq!(
            MessageType::parse("webhook_callback_verification"),
            Some(MessageType::VerificationChallenge)
        );
        assert_eq!(
            MessageType::parse("verification-challenge"),
            Some(MessageType::VerificationChallenge)
        );
        assert_eq!(MessageType::parse("ping"), None);
    }

    #[test]
    fn parses_notification_envelope() {
        let body = r#"{
            "subscription": {
                "id": "sub-1",
                "type": "stream.online",
                "status": "enabled",
                "condition": {"broadcaster_user_id": "1337"},
                "transport": {"method": "webhook", "callback": "https://relay.test/webhook"},
                "created_at": "2024-05-01T10:00:00Z"
            },
            "event": {
                "id": "9001",
                "broadcaster_user_id": "1337",
                "broadcaster_user_login": "cool_streamer",
                "broadcaster_user_name": "Cool_Streamer",
                "type": "live",
                "started_at": "2024-05-01T10:00:00Z"
            }
        }"#;

        let envelope: EventEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(
            envelope.subscription.event_kind(),
            Some(EventKind::StreamOnline)
        );
        assert_eq!(envelope.subscription.entity_id(), Some("1337"));
        assert_eq!(
            envelope.subscription.callback(),
            Some("https://relay.test/webhook")
        );

        let event: StreamOnlineEvent = serde_json::from_value(envelope.event.unwrap()).unwrap();
        assert_eq!(event.display_name(), "Cool_Streamer");
    }

    #[test]
    fn verification_body_needs_a_challenge() {
        let body = r#"{"challenge":"abc","subscription":{"id":"sub-1","type":"stream.online"}}"#;
        let parsed: VerificationChallenge = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.challenge, "abc");

        assert!(serde_json::from_str::<VerificationChallenge>(r#"{"subscription":{}}"#).is_err());
    }

    #[test]
    fn clip_deleted_event_accepts_clip_id_field() {
        let event: ClipDeletedEvent =
            serde_json::from_str(r#"{"clip_id": "AwkwardClip", "broadcaster_user_id": "1"}"#)
                .unwrap();
        assert_eq!(event.id, "AwkwardClip");
    }
}
