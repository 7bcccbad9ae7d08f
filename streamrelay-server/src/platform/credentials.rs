use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::{
    AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse,
    TokenUrl, basic::BasicClient,
};
use shared::{config::server::PlatformConfig, models::Credential};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{PlatformError, PlatformResult};
use crate::db::store::Store;

/// Tokens are renewed this long before the platform would reject them.
const EXPIRY_SKEW_SECS: i64 = 60;
/// Used when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// OAuth2 client with only the token endpoint configured.
type GrantClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Grants that produce a new app credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> PlatformResult<Credential>;
    async fn client_credentials(&self) -> PlatformResult<Credential>;
}

/// Token endpoint client speaking the OAuth2 refresh and client-credentials grants.
#[derive(Debug, Clone)]
pub struct OAuthTokenSource {
    client_id: String,
    client_secret: String,
    token_url: String,
    http: reqwest::Client,
}

impl OAuthTokenSource {
    pub fn new(config: &PlatformConfig) -> PlatformResult<Self> {
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url: config.token_url.clone(),
            http: create_http_client(config.request_timeout())?,
        })
    }

    fn grant_client(&self) -> PlatformResult<GrantClient> {
        let token_url = TokenUrl::new(self.token_url.clone())
            .map_err(|err| PlatformError::Grant(format!("invalid token url: {err}")))?;
        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_type(AuthType::RequestBody)
            .set_token_uri(token_url))
    }

    fn credential_from<T: TokenResponse>(token: &T, previous_refresh: Option<&str>) -> Credential {
        let lifetime = token
            .expires_in()
            .and_then(|expires_in| Duration::from_std(expires_in).ok())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_LIFETIME_SECS));

        Credential {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|refresh| refresh.secret().clone())
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: Utc::now() + lifetime,
        }
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn refresh(&self, refresh_token: &str) -> PlatformResult<Credential> {
        let token = self
            .grant_client()?
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|err| PlatformError::Grant(err.to_string()))?;

        Ok(Self::credential_from(&token, Some(refresh_token)))
    }

    async fn client_credentials(&self) -> PlatformResult<Credential> {
        let token = self
            .grant_client()?
            .exchange_client_credentials()
            .request_async(&self.http)
            .await
            .map_err(|err| PlatformError::Grant(err.to_string()))?;

        Ok(Self::credential_from(&token, None))
    }
}

/// Builds an HTTP client that never follows redirects.
pub fn create_http_client(timeout: std::time::Duration) -> PlatformResult<reqwest::Client> {
    reqwest::ClientBuilder::new()
        // Following redirects opens the client up to SSRF vulnerabilities.
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| PlatformError::Transient(format!("failed to build http client: {err}")))
}

#[derive(Debug, Default)]
struct CredentialState {
    loaded: bool,
    current: Option<Credential>,
}

/// Owner of the process-wide app credential.
///
/// All reads and refreshes go through one mutex, so concurrent callers that
/// observe the same rejected token trigger a single grant between them.
pub struct CredentialManager {
    store: Arc<dyn Store>,
    source: Arc<dyn TokenSource>,
    state: Mutex<CredentialState>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn TokenSource>) -> Self {
        Self {
            store,
            source,
            state: Mutex::new(CredentialState::default()),
        }
    }

    /// A currently valid access token, loading or refreshing as needed.
    pub async fn access_token(&self) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        self.load_once(&mut state).await;

        if let Some(credential) = state.current.as_ref()
            && !credential.is_expired(Utc::now(), Duration::seconds(EXPIRY_SKEW_SECS))
        {
            return Ok(credential.access_token.clone());
        }

        let credential = self.renew(&mut state).await?;
        Ok(credential.access_token)
    }

    /// Called after the platform answered 401 to a request made with `stale`.
    ///
    /// When another caller already replaced that token the replacement is
    /// returned without a second grant.
    #[instrument(skip_all)]
    pub async fn refresh_after_rejection(&self, stale: &str) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        self.load_once(&mut state).await;

        if let Some(credential) = state.current.as_ref()
            && credential.access_token != stale
        {
            return Ok(credential.access_token.clone());
        }

        let credential = self.renew(&mut state).await?;
        Ok(credential.access_token)
    }

    async fn load_once(&self, state: &mut CredentialState) {
        if state.loaded {
            return;
        }
        match self.store.load_credential().await {
            Ok(credential) => {
                if credential.is_some() {
                    info!("loaded persisted platform credential");
                }
                state.current = credential;
                state.loaded = true;
            }
            Err(err) => warn!(error = %err, "failed to load persisted platform credential"),
        }
    }

    async fn renew(&self, state: &mut CredentialState) -> PlatformResult<Credential> {
        let refresh_token = state
            .current
            .as_ref()
            .and_then(|credential| credential.refresh_token.clone());

        let credential = match refresh_token {
            Some(refresh_token) => match self.source.refresh(&refresh_token).await {
                Ok(credential) => {
                    metrics::counter!("streamrelay_platform_token_refreshes_total", "grant" => "refresh_token")
                        .increment(1);
                    credential
                }
                Err(err) => {
                    warn!(error = %err, "refresh grant failed, falling back to client credentials");
                    self.client_credentials().await?
                }
            },
            None => self.client_credentials().await?,
        };

        if let Err(err) = self.store.save_credential(&credential).await {
            warn!(error = %err, "failed to persist refreshed platform credential");
        }

        info!(expires_at = %credential.expires_at, "platform credential renewed");
        state.current = Some(credential.clone());
        state.loaded = true;
        Ok(credential)
    }

    async fn client_credentials(&self) -> PlatformResult<Credential> {
        let credential = self.source.client_credentials().await?;
        metrics::counter!("streamrelay_platform_token_refreshes_total", "grant" => "client_credentials")
            .increment(1);
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrapped_store;
    use axum::{Form, Json, Router, routing::post};
    use serde_json::{Value, json};
    use std::collections::HashMap;

    /// Token endpoint that echoes the grant type back as the access token.
    async fn spawn_token_endpoint() -> String {
        async fn token(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
            let grant = form.get("grant_type").cloned().unwrap_or_default();
            assert_eq!(form.get("client_id").map(String::as_str), Some("relay-app"));
            Json(json!({
                "access_token": format!("{grant}-token"),
                "token_type": "bearer",
                "expires_in": 120,
            }))
        }

        let app = Router::new().route("/token", post(token));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/token")
    }

    fn oauth_source(token_url: String) -> OAuthTokenSource {
        OAuthTokenSource::new(&PlatformConfig {
            client_id: "relay-app".into(),
            client_secret: "relay-secret".into(),
            token_url,
            ..PlatformConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn both_grants_share_the_token_endpoint_client() {
        let source = oauth_source(spawn_token_endpoint().await);

        let fresh = source.client_credentials().await.unwrap();
        assert_eq!(fresh.access_token, "client_credentials-token");
        assert_eq!(fresh.refresh_token, None);

        let refreshed = source.refresh("r-1").await.unwrap();
        assert_eq!(refreshed.access_token, "refresh_token-token");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("r-1"));
        assert!(refreshed.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn invalid_token_url_fails_every_grant() {
        let source = oauth_source("not a url".into());
        assert!(matches!(
            source.client_credentials().await,
            Err(PlatformError::Grant(_))
        ));
        assert!(matches!(
            source.refresh("r-1").await,
            Err(PlatformError::Grant(_))
        ));
    }

    fn credential(token: &str, refresh: Option<&str>, ttl_secs: i64) -> Credential {
        Credential {
            access_token: token.into(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn reuses_persisted_credential_while_valid() {
        let store = Arc::new(bootstrapped_store().await);
        store
            .save_credential(&credential("persisted", Some("r1"), 3600))
            .await
            .unwrap();

        let mut source = MockTokenSource::new();
        source.expect_refresh().never();
        source.expect_client_credentials().never();

        let manager = CredentialManager::new(store, Arc::new(source));
        assert_eq!(manager.access_token().await.unwrap(), "persisted");
        assert_eq!(manager.access_token().await.unwrap(), "persisted");
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_and_persisted() {
        let store = Arc::new(bootstrapped_store().await);
        store
            .save_credential(&credential("old", Some("r1"), 10))
            .await
            .unwrap();

        let mut source = MockTokenSource::new();
        source
            .expect_refresh()
            .withf(|token| token == "r1")
            .times(1)
            .returning(|_| Ok(credential("fresh", Some("r2"), 3600)));

        let manager = CredentialManager::new(store.clone(), Arc::new(source));
        assert_eq!(manager.access_token().await.unwrap(), "fresh");

        let persisted = store.load_credential().await.unwrap().unwrap();
        assert_eq!(persisted.access_token, "fresh");
        assert_eq!(persisted.refresh_token.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_client_credentials() {
        let store = Arc::new(bootstrapped_store().await);
        store
            .save_credential(&credential("old", Some("r1"), -10))
            .await
            .unwrap();

        let mut source = MockTokenSource::new();
        source
            .expect_refresh()
            .times(1)
            .returning(|_| Err(PlatformError::Grant("invalid refresh token".into())));
        source
            .expect_client_credentials()
            .times(1)
            .returning(|| Ok(credential("app-token", None, 3600)));

        let manager = CredentialManager::new(store, Arc::new(source));
        assert_eq!(manager.access_token().await.unwrap(), "app-token");
    }

    #[tokio::test]
    async fn concurrent_rejections_of_the_same_token_coalesce_into_one_grant() {
        let store = Arc::new(bootstrapped_store().await);
        store
            .save_credential(&credential("stale", None, 3600))
            .await
            .unwrap();

        let mut source = MockTokenSource::new();
        source
            .expect_client_credentials()
            .times(1)
            .returning(|| Ok(credential("renewed", None, 3600)));

        let manager = Arc::new(CredentialManager::new(store, Arc::new(source)));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.refresh_after_rejection("stale").await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "renewed");
        }
    }
}
