use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// Snapshot of a live broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl StreamInfo {
    /// Preview image URL with the size placeholders filled in.
    pub fn preview_image(&self, width: u32, height: u32) -> Option<String> {
        self.thumbnail_url.as_ref().map(|url| {
            url.replace("{width}", &width.to_string())
                .replace("{height}", &height.to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub url: String,
    pub broadcaster_id: String,
    pub broadcaster_name: String,
    pub creator_name: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub view_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_image_fills_size_placeholders() {
        let stream = StreamInfo {
            user_id: "1".into(),
            user_login: "a".into(),
            user_name: "A".into(),
            game_name: String::new(),
            title: String::new(),
            viewer_count: 0,
            thumbnail_url: Some("https://cdn/live_user_a-{width}x{height}.jpg".into()),
            started_at: None,
        };
        assert_eq!(
            stream.preview_image(1280, 720).as_deref(),
            Some("https://cdn/live_user_a-1280x720.jpg")
        );
    }
}
