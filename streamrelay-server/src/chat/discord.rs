use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use shared::config::server::ChatConfig;
use tracing::{debug, instrument};

use super::{ChatError, ChatMessage, ChatSink};

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

/// Chat target backed by the Discord REST API.
pub struct DiscordSink {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl std::fmt::Debug for DiscordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordSink")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DiscordSink {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(
                config.request_timeout_secs.max(1),
            ))
            .build()
            .map_err(|err| ChatError::Transient(err.to_string()))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        message: Option<&ChatMessage>,
    ) -> Result<Response, ChatError> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(message) = message {
            request = request.json(message);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ChatError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%status, body = %body, "chat request failed");
        Err(classify(status, body))
    }
}

/// Channel and message ids are numeric snowflakes; anything else would be
/// spliced into the request path.
fn snowflake(id: &str) -> Result<&str, ChatError> {
    if !id.is_empty() && id.len() <= 20 && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id)
    } else {
        Err(ChatError::InvalidTarget(id.to_string()))
    }
}

fn messages_path(destination: &str) -> Result<String, ChatError> {
    Ok(format!("/channels/{}/messages", snowflake(destination)?))
}

fn message_path(destination: &str, handle: &str) -> Result<String, ChatError> {
    Ok(format!(
        "/channels/{}/messages/{}",
        snowflake(destination)?,
        snowflake(handle)?
    ))
}

fn classify(status: StatusCode, body: String) -> ChatError {
    if status == StatusCode::NOT_FOUND {
        return ChatError::Gone;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return ChatError::Transient(format!("status {status}: {body}"));
    }
    ChatError::Rejected {
        status: status.as_u16(),
        message: body,
    }
}

#[async_trait]
impl ChatSink for DiscordSink {
    #[instrument(skip(self, message))]
    async fn send(&self, destination: &str, message: &ChatMessage) -> Result<String, ChatError> {
        let path = messages_path(destination)?;
        let response = self.request(Method::POST, &path, Some(message)).await?;
        let created: CreatedMessage = response
            .json()
            .await
            .map_err(|err| ChatError::Transient(err.to_string()))?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn delete(&self, destination: &str, handle: &str) -> Result<(), ChatError> {
        let path = message_path(destination, handle)?;
        self.request(Method::DELETE, &path, None).await.map(|_| ())
    }

    #[instrument(skip(self, message))]
    async fn edit(
        &self,
        destination: &str,
        handle: &str,
        message: &ChatMessage,
    ) -> Result<(), ChatError> {
        let path = message_path(destination, handle)?;
        self.request(Method::PATCH, &path, Some(message))
            .await
            .map(|_| ())
    }
}
