//! Configuration loading, validation, and management for ModelRelay.
//!
//! Settings come from a TOML file with `MODELRELAY_*` environment
//! variable overrides on top. Everything has a serde default so an empty
//! file (or none at all) yields a runnable config. Secrets are redacted
//! from Debug output.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Client API keys: logical name → secret key.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,

    /// Highest attempt index the router may reach per request.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Per-attempt upstream timeout for non-streaming calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Longest tolerated gap between streamed chunks.
    #[serde(default = "default_stream_idle")]
    pub stream_idle_timeout_secs: u64,

    /// SSE keepalive comment interval.
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Provider credentials and endpoint overrides.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// Logical model → candidate list.
    #[serde(default)]
    pub routes: HashMap<String, Vec<RouteEntry>>,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub log: LogSettings,
}

fn default_listen() -> String {
    "0.0.0.0:8090".into()
}
fn default_retry_budget() -> u32 {
    2
}
fn default_request_timeout() -> u64 {
    120
}
fn default_stream_idle() -> u64 {
    60
}
fn default_keepalive() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_duration")]
    pub open_duration_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// One candidate entry in a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub provider: String,

    /// Wire model id; defaults to the logical id when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret for access tokens; ≥32 bytes, required for the admin
    /// surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_secret: Option<String>,

    #[serde(default = "default_access_ttl")]
    pub access_ttl_minutes: u64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_days: u64,

    #[serde(default = "default_issuer")]
    pub issuer: String,
}

fn default_access_ttl() -> u64 {
    15
}
fn default_refresh_ttl() -> u64 {
    7
}
fn default_issuer() -> String {
    "modelrelay".into()
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_secret: None,
            refresh_secret: None,
            access_ttl_minutes: default_access_ttl(),
            refresh_ttl_days: default_refresh_ttl(),
            issuer: default_issuer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json | text
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "json".into()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AppConfig {
    /// Defaults as if deserialized from an empty document, so serde and
    /// `Default` can never disagree.
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

fn redact(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("listen", &self.listen)
            .field("api_keys", &format!("[{} configured]", self.api_keys.len()))
            .field("retry_budget", &self.retry_budget)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .field("breaker", &self.breaker)
            .field("providers", &self.providers)
            .field("routes", &self.routes)
            .field("auth", &self.auth)
            .field("log", &self.log)
            .finish()
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("access_secret", &redact(&self.access_secret))
            .field("refresh_secret", &redact(&self.refresh_secret))
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_days", &self.refresh_ttl_days)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl AppConfig {
    /// Load from a TOML file (when it exists), then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `MODELRELAY_*` environment variables override file values.
    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("MODELRELAY_LISTEN") {
            self.listen = listen;
        }
        if let Ok(raw) = std::env::var("MODELRELAY_API_KEYS") {
            self.api_keys = parse_api_key_map(&raw);
        }
        if let Ok(budget) = std::env::var("MODELRELAY_RETRY_BUDGET")
            && let Ok(budget) = budget.parse()
        {
            self.retry_budget = budget;
        }
        if let Ok(secret) = std::env::var("MODELRELAY_JWT_ACCESS_SECRET") {
            self.auth.access_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var("MODELRELAY_JWT_REFRESH_SECRET") {
            self.auth.refresh_secret = Some(secret);
        }
        if let Ok(ttl) = std::env::var("MODELRELAY_JWT_ACCESS_TTL_MINUTES")
            && let Ok(ttl) = ttl.parse()
        {
            self.auth.access_ttl_minutes = ttl;
        }
        if let Ok(ttl) = std::env::var("MODELRELAY_JWT_REFRESH_TTL_DAYS")
            && let Ok(ttl) = ttl.parse()
        {
            self.auth.refresh_ttl_days = ttl;
        }
        if let Ok(level) = std::env::var("MODELRELAY_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(format) = std::env::var("MODELRELAY_LOG_FORMAT") {
            self.log.format = format;
        }
        for provider in ["openai", "anthropic", "gemini"] {
            let var = format!("MODELRELAY_{}_API_KEY", provider.to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                self.providers.entry(provider.into()).or_default().api_key = Some(key);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for secret in [&self.auth.access_secret, &self.auth.refresh_secret]
            .into_iter()
            .flatten()
        {
            if secret.len() < 32 {
                return Err(ConfigError::Invalid(
                    "JWT secrets must be at least 32 bytes".into(),
                ));
            }
        }
        for (model, entries) in &self.routes {
            if entries.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route '{model}' has no candidates"
                )));
            }
        }
        match self.log.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown log format '{other}' (expected json or text)"
                )));
            }
        }
        Ok(())
    }
}

/// Parse the `name:key,name:key,…` format used by `MODELRELAY_API_KEYS`.
pub fn parse_api_key_map(raw: &str) -> HashMap<String, String> {
    let mut keys = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once(':') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => {
                keys.insert(name.to_string(), key.to_string());
            }
            _ => warn!(entry, "skipping malformed api-key entry"),
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_runnable() {
        let config = AppConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8090");
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.auth.access_ttl_minutes, 15);
        assert_eq!(config.auth.refresh_ttl_days, 7);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn parses_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listen = "127.0.0.1:9000"
retry_budget = 3

[api_keys]
alice = "sk-alice"

[providers.openai]
api_key = "sk-upstream"

[[routes.gpt-4o-mini]]
provider = "openai"
weight = 90

[[routes.gpt-4o-mini]]
provider = "gemini"
upstream_model = "gemini-2.0-flash"
weight = 10
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.api_keys["alice"], "sk-alice");

        let route = &config.routes["gpt-4o-mini"];
        assert_eq!(route.len(), 2);
        assert_eq!(route[1].upstream_model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(route[0].weight, 90);
    }

    #[test]
    fn short_jwt_secret_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[auth]
access_secret = "too-short"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_route_rejected() {
        let config: AppConfig = toml::from_str("[routes]\n\"m\" = []\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let config: AppConfig = toml::from_str("[log]\nformat = \"yaml\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_map_parsing() {
        let keys = parse_api_key_map("alice:sk-a,bob:sk-b,,broken");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["alice"], "sk-a");
        assert_eq!(keys["bob"], "sk-b");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config: AppConfig = toml::from_str(
            r#"
[api_keys]
alice = "sk-secret-value"

[providers.openai]
api_key = "sk-upstream-secret"

[auth]
access_secret = "0123456789abcdef0123456789abcdef"
"#,
        )
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-value"));
        assert!(!debug.contains("sk-upstream-secret"));
        assert!(!debug.contains("0123456789abcdef"));
        assert!(debug.contains("[REDACTED]"));
    }
}
