//! Fixed message layouts for live and clip notifications.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use shared::models::{Clip, StreamInfo, StreamOnlineEvent};

use crate::chat::{ChatMessage, Embed, EmbedField, EmbedImage};

const LIVE_COLOR: u32 = 0x0091_46FF;
const CHANNEL_BASE_URL: &str = "https://twitch.tv";

/// Stream data shown in a live notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSnapshot {
    pub title: String,
    pub game: String,
    pub viewer_count: u64,
    pub image_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl LiveSnapshot {
    pub fn from_stream(stream: &StreamInfo) -> Self {
        Self {
            title: stream.title.clone(),
            game: stream.game_name.clone(),
            viewer_count: stream.viewer_count,
            image_url: stream.preview_image(1280, 720),
            started_at: stream.started_at,
        }
    }

    /// Placeholder used when stream data never became available.
    pub fn degraded(event: &StreamOnlineEvent) -> Self {
        Self {
            title: "Live Stream".into(),
            game: event.category_name.clone().unwrap_or_default(),
            viewer_count: 0,
            image_url: None,
            started_at: event.started_at,
        }
    }
}

pub fn channel_url(login: &str) -> String {
    format!("{CHANNEL_BASE_URL}/{login}")
}

/// Appends a random query parameter so chat clients do not reuse a cached preview.
fn cache_busted(url: &str) -> String {
    let nonce: u32 = rand::rng().random();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}t={nonce}")
}

pub fn live_message(
    event: &StreamOnlineEvent,
    snapshot: &LiveSnapshot,
    followers: Option<u64>,
    avatar_url: Option<&str>,
) -> ChatMessage {
    let url = channel_url(&event.broadcaster_user_login);
    let game = if snapshot.game.is_empty() {
        "Unknown".to_string()
    } else {
        snapshot.game.clone()
    };

    let embed = Embed {
        title: format!("🔴 {} is now live!", event.display_name()),
        url: Some(url.clone()),
        description: Some(snapshot.title.clone()),
        color: LIVE_COLOR,
        image: snapshot.image_url.as_deref().map(|image| EmbedImage {
            url: cache_busted(image),
        }),
        thumbnail: avatar_url.map(|avatar| EmbedImage {
            url: avatar.to_string(),
        }),
        fields: vec![
            EmbedField {
                name: "Game".into(),
                value: game,
                inline: true,
            },
            EmbedField {
                name: "Followers".into(),
                value: followers.map_or_else(|| "N/A".to_string(), |count| count.to_string()),
                inline: true,
            },
            EmbedField {
                name: "Watch".into(),
                value: format!("[Open Stream]({url})"),
                inline: false,
            },
        ],
        timestamp: snapshot
            .started_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    };

    ChatMessage {
        content: None,
        embeds: vec![embed],
    }
}

pub fn clip_message(clip: &Clip) -> ChatMessage {
    ChatMessage::text(format!(
        "{} just created a new clip on {} channel\n{}\n{}",
        clip.creator_name, clip.broadcaster_name, clip.title, clip.url
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> StreamOnlineEvent {
        StreamOnlineEvent {
            id: None,
            broadcaster_user_id: "1337".into(),
            broadcaster_user_login: "cool_streamer".into(),
            broadcaster_user_name: Some("Cool_Streamer".into()),
            stream_type: Some("live".into()),
            started_at: None,
            category_name: None,
        }
    }

    #[test]
    fn degraded_live_message_still_has_layout() {
        let message = live_message(&event(), &LiveSnapshot::degraded(&event()), None, None);
        let embed = &message.embeds[0];
        assert_eq!(embed.title, "🔴 Cool_Streamer is now live!");
        assert_eq!(embed.description.as_deref(), Some("Live Stream"));
        assert!(embed.image.is_none());
        assert_eq!(embed.fields[0].value, "Unknown");
        assert_eq!(embed.fields[1].value, "N/A");
        assert_eq!(
            embed.fields[2].value,
            "[Open Stream](https://twitch.tv/cool_streamer)"
        );
    }

    #[test]
    fn preview_image_is_cache_busted() {
        let snapshot = LiveSnapshot {
            title: "speedrun".into(),
            game: "Celeste".into(),
            viewer_count: 10,
            image_url: Some("https://cdn.test/preview.jpg".into()),
            started_at: None,
        };
        let message = live_message(&event(), &snapshot, Some(42), None);
        let image = message.embeds[0].image.as_ref().unwrap();
        assert!(image.url.starts_with("https://cdn.test/preview.jpg?t="));
        assert_eq!(message.embeds[0].fields[1].value, "42");
    }

    #[test]
    fn clip_message_lists_creator_title_and_url() {
        let clip = crate::test_support::clip("clip-1", "1337", Utc::now());
        let message = clip_message(&clip);
        assert_eq!(
            message.content.as_deref(),
            Some("viewer just created a new clip on Streamer channel\ntitle of clip-1\nhttps://clips.test/clip-1")
        );
    }
}
