use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Deployment profile used to pick default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Dev,
    Test,
    Prod,
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported configuration format for {0}; use yaml, toml or json")]
    UnsupportedFormat(PathBuf),
    #[error("invalid {var} value: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_id_header: String,
    /// Bearer token required by the `/api` routes. Empty disables them.
    pub admin_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            request_id_header: "x-request-id".into(),
            admin_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/streamrelay.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub token_url: String,
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base_url: "https://api.twitch.tv/helix".into(),
            token_url: "https://id.twitch.tv/oauth2/token".into(),
            request_timeout_secs: 10,
        }
    }
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    /// Public URL the platform delivers notifications to. Also identifies
    /// which remote subscriptions belong to this deployment.
    pub callback_url: String,
    /// Shared HMAC secret. `None` runs the gate in insecure mode.
    pub secret: Option<String>,
    pub path: String,
    pub max_message_age_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            secret: None,
            path: "/webhook".into(),
            max_message_age_secs: 600,
        }
    }
}

impl WebhookConfig {
    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    pub api_base_url: String,
    pub bot_token: String,
    pub request_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://discord.com/api/v10".into(),
            bot_token: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    pub cooldown_secs: u64,
    pub live_initial_delay_secs: u64,
    pub live_retry_count: u32,
    pub live_retry_backoff_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            live_initial_delay_secs: 5,
            live_retry_count: 3,
            live_retry_backoff_secs: 2,
        }
    }
}

impl NotificationConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn live_initial_delay(&self) -> Duration {
        Duration::from_secs(self.live_initial_delay_secs)
    }

    pub fn live_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.live_retry_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    /// Lower bound on the fetched window; the effective window is never
    /// shorter than twice the interval.
    pub lookback_secs: u64,
    pub deletion_retention_days: u32,
    /// Status codes that count as definitive absence when re-checking a
    /// delivered item. Every other failure is treated as "still exists".
    pub absent_status_codes: Vec<u16>,
    pub entity_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            initial_delay_secs: 30,
            lookback_secs: 7200,
            deletion_retention_days: 7,
            absent_status_codes: vec![400, 404],
            entity_timeout_secs: 60,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.lookback_secs.max(self.interval_secs.saturating_mul(2)))
    }

    pub fn deletion_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.deletion_retention_days) * 24 * 60 * 60)
    }

    pub fn entity_timeout(&self) -> Duration {
        Duration::from_secs(self.entity_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub sweep_on_startup: bool,
    /// Interval between periodic sweeps. `None` disables the periodic sweep.
    pub sweep_interval_secs: Option<u64>,
    pub subscribe_attempts: u32,
    pub subscribe_backoff_ms: u64,
    pub entity_timeout_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sweep_on_startup: true,
            sweep_interval_secs: Some(6 * 60 * 60),
            subscribe_attempts: 3,
            subscribe_backoff_ms: 500,
            entity_timeout_secs: 30,
        }
    }
}

impl ReconciliationConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn subscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.subscribe_backoff_ms)
    }

    pub fn entity_timeout(&self) -> Duration {
        Duration::from_secs(self.entity_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub concurrency: usize,
    /// How many recently accepted webhook message ids are remembered for
    /// duplicate suppression.
    pub recent_message_ids: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            concurrency: 8,
            recent_message_ids: 1024,
        }
    }
}

/// The main configuration structure for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub db: DatabaseConfig,
    pub platform: PlatformConfig,
    pub webhook: WebhookConfig,
    pub chat: ChatConfig,
    pub notifications: NotificationConfig,
    pub polling: PollingConfig,
    pub reconciliation: ReconciliationConfig,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Default configuration tuned for the given profile.
    pub fn default_for_profile(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Self::default()
        };

        match profile {
            Profile::Dev => {
                config.logging.level = "debug".into();
            }
            Profile::Test => {
                config.db.url = "sqlite::memory:".into();
                config.db.max_connections = 1;
                config.webhook.callback_url = "https://relay.test/webhook".into();
                config.webhook.secret = Some("test-webhook-secret".into());
                config.notifications.live_initial_delay_secs = 0;
                config.notifications.live_retry_backoff_secs = 0;
                config.reconciliation.sweep_on_startup = false;
                config.reconciliation.sweep_interval_secs = None;
                config.reconciliation.subscribe_backoff_ms = 0;
                config.polling.enabled = false;
            }
            Profile::Prod => {
                config.logging.format = LogFormat::Json;
            }
        }

        config
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// Precedence, lowest first: profile defaults, file, `STREAMRELAY_*`
    /// environment variables, `port_override`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the file cannot be read or parsed, an
    /// environment override is malformed, or the result fails validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => {
                let profile = match env::var("STREAMRELAY_PROFILE") {
                    Ok(value) => parse_profile(&value)?,
                    Err(_) => Profile::Dev,
                };
                Self::default_for_profile(profile)
            }
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading configuration file");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            Some("toml") => toml::from_str(&content).map_err(|err| parse_error(err.to_string())),
            Some("json") => {
                serde_json::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Applies `STREAMRELAY_*` environment variables on top of the current values.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidEnv`] when a numeric variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = env_parse::<u16>("STREAMRELAY_PORT")? {
            self.server.port = port;
        }
        if let Ok(token) = env::var("STREAMRELAY_ADMIN_TOKEN") {
            self.server.admin_token = token;
        }
        if let Ok(url) = env::var("STREAMRELAY_DATABASE_URL") {
            self.db.url = url;
        }
        if let Ok(level) = env::var("STREAMRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("STREAMRELAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "STREAMRELAY_LOG_FORMAT",
                        value: format,
                    });
                }
            };
        }
        if let Ok(client_id) = env::var("STREAMRELAY_PLATFORM_CLIENT_ID") {
            self.platform.client_id = client_id;
        }
        if let Ok(client_secret) = env::var("STREAMRELAY_PLATFORM_CLIENT_SECRET") {
            self.platform.client_secret = client_secret;
        }
        if let Ok(callback) = env::var("STREAMRELAY_WEBHOOK_CALLBACK_URL") {
            self.webhook.callback_url = callback;
        }
        if let Ok(secret) = env::var("STREAMRELAY_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret).filter(|value| !value.is_empty());
        }
        if let Ok(token) = env::var("STREAMRELAY_CHAT_BOT_TOKEN") {
            self.chat.bot_token = token;
        }
        if let Some(cooldown) = env_parse::<u64>("STREAMRELAY_COOLDOWN_SECS")? {
            self.notifications.cooldown_secs = cooldown;
        }
        if let Some(interval) = env_parse::<u64>("STREAMRELAY_POLL_INTERVAL_SECS")? {
            self.polling.interval_secs = interval;
        }
        Ok(())
    }

    /// Checks cross-field constraints and collects every violation.
    ///
    /// # Errors
    /// Returns the list of human-readable problems when any check fails.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.db.url.trim().is_empty() {
            errors.push("db.url must not be empty".to_string());
        }
        if !self.webhook.callback_url.is_empty()
            && url::Url::parse(&self.webhook.callback_url).is_err()
        {
            errors.push(format!(
                "webhook.callback_url is not a valid URL: {}",
                self.webhook.callback_url
            ));
        }
        if !self.webhook.path.starts_with('/') {
            errors.push("webhook.path must start with '/'".to_string());
        }
        if self.webhook.max_message_age_secs == 0 {
            errors.push("webhook.max_message_age_secs must be greater than 0".to_string());
        }
        if self.polling.interval_secs == 0 {
            errors.push("polling.interval_secs must be greater than 0".to_string());
        }
        if self.dispatch.queue_capacity == 0 || self.dispatch.concurrency == 0 {
            errors.push("dispatch.queue_capacity and dispatch.concurrency must be positive".into());
        }
        if self.reconciliation.subscribe_attempts == 0 {
            errors.push("reconciliation.subscribe_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_profile(value: &str) -> Result<Profile, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "dev" => Ok(Profile::Dev),
        "test" => Ok(Profile::Test),
        "prod" => Ok(Profile::Prod),
        _ => Err(ConfigError::InvalidEnv {
            var: "STREAMRELAY_PROFILE",
            value: value.to_string(),
        }),
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
