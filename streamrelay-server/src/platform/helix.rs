use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use shared::{
    config::server::{PlatformConfig, WebhookConfig},
    models::{Clip, EventKind, PlatformUser, StreamInfo, SubscriptionDescriptor},
};
use tracing::{debug, instrument, warn};

use super::{
    PlatformApi, PlatformError, PlatformResult, credentials::CredentialManager,
    credentials::create_http_client,
};

/// Upper bound on pages fetched for a single listing.
const MAX_PAGES: usize = 20;
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowerTotal {
    total: u64,
}

/// REST client for the platform's Helix-style API.
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    callback_url: String,
    webhook_secret: Option<String>,
    credentials: Arc<CredentialManager>,
}

impl std::fmt::Debug for HelixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelixClient")
            .field("base_url", &self.base_url)
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

impl HelixClient {
    pub fn new(
        platform: &PlatformConfig,
        webhook: &WebhookConfig,
        credentials: Arc<CredentialManager>,
    ) -> PlatformResult<Self> {
        Ok(Self {
            http: create_http_client(platform.request_timeout())?,
            base_url: platform.api_base_url.trim_end_matches('/').to_string(),
            client_id: platform.client_id.clone(),
            callback_url: webhook.callback_url.clone(),
            webhook_secret: webhook.secret.clone(),
            credentials,
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> PlatformResult<Response> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{path}", self.base_url))
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Sends a request, refreshing the credential once on 401 and retrying.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> PlatformResult<Response> {
        let token = self.credentials.access_token().await?;
        let response = self.send_once(&method, path, query, body, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        warn!(%method, path, "platform rejected credential, refreshing");
        let token = self.credentials.refresh_after_rejection(&token).await?;
        let response = self.send_once(&method, path, query, body, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::Transient(
                "credential rejected again after refresh".into(),
            ));
        }
        check(response).await
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> PlatformResult<Page<T>> {
        let response = self.execute(Method::GET, path, query, None).await?;
        response
            .json::<Page<T>>()
            .await
            .map_err(|err| PlatformError::Decode(err.to_string()))
    }

    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> PlatformResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut page_query = query.to_vec();
            if let Some(after) = cursor.take() {
                page_query.push(("after", after));
            }

            let page: Page<T> = self.get_page(path, &page_query).await?;
            let received = page.data.len();
            items.extend(page.data);

            cursor = page
                .pagination
                .and_then(|pagination| pagination.cursor)
                .filter(|cursor| !cursor.is_empty());
            if cursor.is_none() || received == 0 {
                return Ok(items);
            }
        }

        warn!(path, "stopped paging after {MAX_PAGES} pages");
        Ok(items)
    }

    async fn first<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> PlatformResult<Option<T>> {
        let page: Page<T> = self.get_page(path, query).await?;
        Ok(page.data.into_iter().next())
    }
}

async fn check(response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(%status, body = %body, "platform request failed");
    Err(PlatformError::from_status(status, body))
}

#[async_trait]
impl PlatformApi for HelixClient {
    #[instrument(skip(self), fields(kind = %kind))]
    async fn create_subscription(
        &self,
        kind: EventKind,
        entity_id: &str,
    ) -> PlatformResult<SubscriptionDescriptor> {
        let mut transport = json!({
            "method": "webhook",
            "callback": self.callback_url,
        });
        if let Some(secret) = &self.webhook_secret {
            transport["secret"] = json!(secret);
        }
        let body = json!({
            "type": kind.as_str(),
            "version": kind.version(),
            "condition": { "broadcaster_user_id": entity_id },
            "transport": transport,
        });

        let response = self
            .execute(Method::POST, "/eventsub/subscriptions", &[], Some(&body))
            .await?;
        let page: Page<SubscriptionDescriptor> = response
            .json()
            .await
            .map_err(|err| PlatformError::Decode(err.to_string()))?;
        page.data
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Decode("subscription response had no data".into()))
    }

    #[instrument(skip(self))]
    async fn delete_subscription(&self, subscription_id: &str) -> PlatformResult<()> {
        self.execute(
            Method::DELETE,
            "/eventsub/subscriptions",
            &[("id", subscription_id.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn list_subscriptions(&self) -> PlatformResult<Vec<SubscriptionDescriptor>> {
        self.get_all("/eventsub/subscriptions", &[]).await
    }

    async fn get_user_by_name(&self, login: &str) -> PlatformResult<Option<PlatformUser>> {
        self.first("/users", &[("login", login.to_string())]).await
    }

    async fn get_user_by_id(&self, user_id: &str) -> PlatformResult<Option<PlatformUser>> {
        self.first("/users", &[("id", user_id.to_string())]).await
    }

    async fn get_stream(&self, user_id: &str) -> PlatformResult<Option<StreamInfo>> {
        self.first("/streams", &[("user_id", user_id.to_string())])
            .await
    }

    async fn get_follower_count(&self, user_id: &str) -> PlatformResult<u64> {
        let response = self
            .execute(
                Method::GET,
                "/channels/followers",
                &[
                    ("broadcaster_id", user_id.to_string()),
                    ("first", "1".to_string()),
                ],
                None,
            )
            .await?;
        let total: FollowerTotal = response
            .json()
            .await
            .map_err(|err| PlatformError::Decode(err.to_string()))?;
        Ok(total.total)
    }

    async fn get_clips(
        &self,
        broadcaster_id: &str,
        started_at: DateTime<Utc>,
    ) -> PlatformResult<Vec<Clip>> {
        self.get_all(
            "/clips",
            &[
                ("broadcaster_id", broadcaster_id.to_string()),
                (
                    "started_at",
                    started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("first", PAGE_SIZE.to_string()),
            ],
        )
        .await
    }

    async fn get_clip(&self, clip_id: &str) -> PlatformResult<Option<Clip>> {
        self.first("/clips", &[("id", clip_id.to_string())]).await
    }
}

#[cfg(test)]
#[path = "helix_tests.rs"]
mod tests;
