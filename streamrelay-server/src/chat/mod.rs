//! Delivery target: chat channels that receive rendered notifications.

pub mod discord;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use discord::DiscordSink;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The message or channel no longer exists.
    #[error("chat message or channel is gone")]
    Gone,
    #[error("transient chat failure: {0}")]
    Transient(String),
    #[error("chat platform rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The destination or message handle is not a valid platform id.
    #[error("invalid chat target: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Body of a chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl ChatMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            embeds: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Posts a message and returns its handle.
    async fn send(&self, destination: &str, message: &ChatMessage) -> Result<String, ChatError>;
    async fn delete(&self, destination: &str, handle: &str) -> Result<(), ChatError>;
    async fn edit(
        &self,
        destination: &str,
        handle: &str,
        message: &ChatMessage,
    ) -> Result<(), ChatError>;
}
