use anyhow::{Context, Result};
use reqwest::Url;
use serde::Deserialize;
use std::path::Path;

pub const ENV_SOURCE_URL: &str = "MATTERBRIDGE_API_URL";
pub const ENV_SOURCE_USERNAME: &str = "MATTERBRIDGE_API_USERNAME";
pub const ENV_SOURCE_PASSWORD: &str = "MATTERBRIDGE_API_PASSWORD";
pub const ENV_WEBHOOK_URL: &str = "WEBHOOK_URL";
pub const ENV_MESSAGE_PREFIX: &str = "MESSAGE_PREFIX";
pub const ENV_ENABLE_TELEMETRY: &str = "ENABLE_TELEMETRY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_source_config")]
    pub source: SourceConfig,
    #[serde(default = "default_webhook_config")]
    pub webhook: WebhookConfig,
    #[serde(default = "default_reconnect_config")]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
    #[serde(default = "default_telemetry_config")]
    pub telemetry: TelemetryConfig,
}

/// The gateway API serving `/api/stream`
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated on an open stream before reconnecting
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    /// Only messages whose text starts with this are forwarded. Empty forwards everything.
    #[serde(default)]
    pub message_prefix: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter as a fraction of the current interval (0 disables it)
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_cron")]
    pub heartbeat_cron: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_randomization_factor() -> f64 {
    0.5
}

fn default_channel_capacity() -> usize {
    1
}

fn default_heartbeat_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_source_config() -> SourceConfig {
    SourceConfig {
        url: String::new(),
        username: String::new(),
        password: String::new(),
        connect_timeout_secs: default_connect_timeout_secs(),
        read_timeout_secs: default_read_timeout_secs(),
    }
}

fn default_webhook_config() -> WebhookConfig {
    WebhookConfig {
        url: String::new(),
        message_prefix: String::new(),
        timeout_secs: default_webhook_timeout_secs(),
    }
}

fn default_reconnect_config() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: default_initial_delay_ms(),
        max_delay_ms: default_max_delay_ms(),
        multiplier: default_multiplier(),
        randomization_factor: default_randomization_factor(),
    }
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        channel_capacity: default_channel_capacity(),
    }
}

fn default_telemetry_config() -> TelemetryConfig {
    TelemetryConfig {
        enabled: false,
        heartbeat_cron: default_heartbeat_cron(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source_config(),
            webhook: default_webhook_config(),
            reconnect: default_reconnect_config(),
            relay: default_relay_config(),
            telemetry: default_telemetry_config(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then let the
    /// environment override it. Fails if the result is not runnable.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::from_toml_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML")
    }

    /// Override settings from environment-style lookups. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get(ENV_SOURCE_URL) {
            self.source.url = v;
        }
        if let Some(v) = get(ENV_SOURCE_USERNAME) {
            self.source.username = v;
        }
        if let Some(v) = get(ENV_SOURCE_PASSWORD) {
            self.source.password = v;
        }
        if let Some(v) = get(ENV_WEBHOOK_URL) {
            self.webhook.url = v;
        }
        if let Some(v) = get(ENV_MESSAGE_PREFIX) {
            self.webhook.message_prefix = v;
        }
        if let Some(v) = get(ENV_ENABLE_TELEMETRY) {
            self.telemetry.enabled = v == "yes";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() || self.webhook.url.is_empty() {
            anyhow::bail!(
                "the api and webhook urls must be set ({} and {})",
                ENV_SOURCE_URL,
                ENV_WEBHOOK_URL
            );
        }
        self.webhook_url()?;
        if self.relay.channel_capacity == 0 {
            anyhow::bail!("relay.channel_capacity must be at least 1");
        }
        if self.source.connect_timeout_secs == 0 {
            anyhow::bail!("source.connect_timeout_secs must be at least 1");
        }
        if self.source.read_timeout_secs == 0 {
            anyhow::bail!("source.read_timeout_secs must be at least 1");
        }
        if self.webhook.timeout_secs == 0 {
            anyhow::bail!("webhook.timeout_secs must be at least 1");
        }
        if self.reconnect.initial_delay_ms == 0 {
            anyhow::bail!("reconnect.initial_delay_ms must be at least 1");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!(
                "reconnect.initial_delay_ms ({}) must not exceed reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            anyhow::bail!("reconnect.multiplier must be a finite number of at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.reconnect.randomization_factor) {
            anyhow::bail!("reconnect.randomization_factor must be between 0 and 1");
        }
        Ok(())
    }

    pub fn webhook_url(&self) -> Result<Url> {
        Url::parse(&self.webhook.url)
            .with_context(|| format!("Invalid webhook url: {}", self.webhook.url))
    }

    /// True when the source should be sent basic auth credentials
    pub fn has_source_credentials(&self) -> bool {
        !self.source.username.is_empty() && !self.source.password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_only_config() {
        let mut config = Config::default();
        config.apply_env(env(&[
            (ENV_SOURCE_URL, "http://bridge:4242"),
            (ENV_WEBHOOK_URL, "http://hook/in"),
            (ENV_MESSAGE_PREFIX, "!bot "),
            (ENV_ENABLE_TELEMETRY, "yes"),
        ]));
        config.validate().unwrap();

        assert_eq!(config.source.url, "http://bridge:4242");
        assert_eq!(config.webhook.message_prefix, "!bot ");
        assert!(config.telemetry.enabled);
        assert!(!config.has_source_credentials());
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.relay.channel_capacity, 1);
    }

    #[test]
    fn test_missing_urls_is_an_error() {
        let mut config = Config::default();
        config.apply_env(env(&[(ENV_SOURCE_URL, "http://bridge:4242")]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be set"));
    }

    #[test]
    fn test_invalid_webhook_url_is_an_error() {
        let mut config = Config::default();
        config.apply_env(env(&[
            (ENV_SOURCE_URL, "http://bridge:4242"),
            (ENV_WEBHOOK_URL, "not a url"),
        ]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str(
            r#"
            [source]
            url = "http://file-bridge"
            username = "relay"
            password = "secret"

            [webhook]
            url = "http://file-hook"
            message_prefix = "!file"

            [reconnect]
            initial_delay_ms = 250
            multiplier = 2.0
            "#,
        )
        .unwrap();
        config.apply_env(env(&[
            (ENV_WEBHOOK_URL, "http://env-hook"),
            (ENV_MESSAGE_PREFIX, ""),
        ]));
        config.validate().unwrap();

        assert_eq!(config.source.url, "http://file-bridge");
        assert_eq!(config.webhook.url, "http://env-hook");
        assert_eq!(config.webhook.message_prefix, "!file");
        assert!(config.has_source_credentials());
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
        assert_eq!(config.reconnect.multiplier, 2.0);
    }

    #[test]
    fn test_telemetry_requires_yes() {
        let mut config = Config::default();
        config.telemetry.enabled = true;
        config.apply_env(env(&[(ENV_ENABLE_TELEMETRY, "true")]));
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_rejects_bad_tunables() {
        let mut config = Config::default();
        config.source.url = "http://bridge".to_string();
        config.webhook.url = "http://hook".to_string();
        config.relay.channel_capacity = 0;
        assert!(config.validate().is_err());

        config.relay.channel_capacity = 4;
        config.reconnect.randomization_factor = 1.5;
        assert!(config.validate().is_err());
    }

    fn runnable() -> Config {
        let mut config = Config::default();
        config.source.url = "http://bridge".to_string();
        config.webhook.url = "http://hook".to_string();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_rejects_zero_initial_delay() {
        let mut config = runnable();
        config.reconnect.initial_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_initial_delay_above_cap() {
        let mut config = runnable();
        config.reconnect.initial_delay_ms = 120_000;
        config.reconnect.max_delay_ms = 60_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_rejects_non_finite_multiplier() {
        let mut config = runnable();
        config.reconnect.multiplier = f64::NAN;
        assert!(config.validate().is_err());

        config.reconnect.multiplier = f64::INFINITY;
        assert!(config.validate().is_err());

        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_nan_multiplier_from_toml() {
        let mut config = Config::from_toml_str(
            r#"
            [source]
            url = "http://bridge"

            [webhook]
            url = "http://hook"

            [reconnect]
            multiplier = nan
            "#,
        )
        .unwrap();
        config.apply_env(|_| None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let mut config = runnable();
        config.webhook.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.source.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.source.read_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
