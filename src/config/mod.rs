use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::models::job::Orientation;
use crate::services::backoff::BackoffPolicy;
use crate::services::cdn::CdnRewrite;
use crate::services::poller::PollSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string for the task ledger
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Base URL of the remote video service
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,

    /// Model name sent with every submission
    #[serde(default = "default_remote_model")]
    pub remote_model: String,

    /// Optional HTTP proxy for remote calls
    pub proxy: Option<String>,

    /// API credentials, comma-separated
    #[serde(default)]
    pub credentials: Vec<String>,

    /// Concurrent jobs allowed per credential
    #[serde(default = "default_credential_ceiling")]
    pub credential_ceiling: u32,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_backoff_min_secs")]
    pub backoff_min_secs: u64,

    #[serde(default = "default_backoff_budget_secs")]
    pub backoff_budget_secs: u64,

    /// Interval between result lookups once a job has left the queue
    #[serde(default = "default_resolve_interval_secs")]
    pub resolve_interval_secs: u64,

    /// How long to look for the result before giving up
    #[serde(default = "default_resolve_max_wait_secs")]
    pub resolve_max_wait_secs: u64,

    /// `none`, `prepend` or `replace_host`
    #[serde(default = "default_cdn_rewrite_mode")]
    pub cdn_rewrite_mode: String,

    pub cdn_base_url: Option<String>,

    /// Prompt used when a request carries none
    #[serde(default = "default_prompt")]
    pub default_prompt: String,

    /// Orientation used when `auto` cannot be derived from an image
    #[serde(default = "default_orientation")]
    pub default_orientation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_url() -> String {
    "sqlite://video_tasks.db".to_string()
}

fn default_remote_base_url() -> String {
    "https://sora.chatgpt.com".to_string()
}

fn default_remote_model() -> String {
    "sy_8".to_string()
}

fn default_credential_ceiling() -> u32 {
    2
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_backoff_min_secs() -> u64 {
    5
}

fn default_backoff_budget_secs() -> u64 {
    300
}

fn default_resolve_interval_secs() -> u64 {
    3
}

fn default_resolve_max_wait_secs() -> u64 {
    30
}

fn default_cdn_rewrite_mode() -> String {
    "none".to_string()
}

fn default_prompt() -> String {
    "Make this image come alive, cinematic motion, smooth animation".to_string()
}

fn default_orientation() -> String {
    "portrait".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the derived values so a bad setting fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential_ceiling == 0 {
            return Err(ConfigError::Invalid("CREDENTIAL_CEILING must be at least 1".to_string()));
        }
        self.backoff_policy()?;
        self.poll_settings()?;
        self.cdn_rewrite()?;
        self.default_orientation()?;
        Ok(())
    }

    /// Non-blank credentials, trimmed.
    pub fn credential_secrets(&self) -> Vec<String> {
        self.credentials
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn backoff_policy(&self) -> Result<BackoffPolicy, ConfigError> {
        if self.backoff_min_secs == 0 {
            return Err(ConfigError::Invalid("BACKOFF_MIN_SECS must be at least 1".to_string()));
        }
        if self.backoff_max_secs < self.backoff_min_secs {
            return Err(ConfigError::Invalid(
                "BACKOFF_MAX_SECS must not be below BACKOFF_MIN_SECS".to_string(),
            ));
        }
        Ok(BackoffPolicy {
            max_interval: Duration::from_secs(self.backoff_max_secs),
            min_interval: Duration::from_secs(self.backoff_min_secs),
            budget: Duration::from_secs(self.backoff_budget_secs),
        })
    }

    pub fn poll_settings(&self) -> Result<PollSettings, ConfigError> {
        if self.resolve_interval_secs == 0 {
            return Err(ConfigError::Invalid("RESOLVE_INTERVAL_SECS must be at least 1".to_string()));
        }
        Ok(PollSettings {
            queue: self.backoff_policy()?,
            resolve: BackoffPolicy::fixed(
                Duration::from_secs(self.resolve_interval_secs),
                Duration::from_secs(self.resolve_max_wait_secs),
            ),
            ..PollSettings::default()
        })
    }

    pub fn cdn_rewrite(&self) -> Result<CdnRewrite, ConfigError> {
        let base = || {
            self.cdn_base_url
                .clone()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| ConfigError::Invalid("CDN_BASE_URL is required for this CDN_REWRITE_MODE".to_string()))
        };
        match self.cdn_rewrite_mode.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CdnRewrite::None),
            "prepend" => Ok(CdnRewrite::Prepend(base()?)),
            "replace_host" => Ok(CdnRewrite::ReplaceHost(base()?)),
            other => Err(ConfigError::Invalid(format!("Unknown CDN_REWRITE_MODE: {other}"))),
        }
    }

    pub fn default_orientation(&self) -> Result<Orientation, ConfigError> {
        Orientation::from_str(self.default_orientation.trim())
            .map_err(|_| ConfigError::Invalid(format!("Unknown DEFAULT_ORIENTATION: {}", self.default_orientation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn defaults_match_the_documented_schedule() {
        let config = config();
        assert_eq!(config.backoff_policy().unwrap(), BackoffPolicy::default());
        assert_eq!(config.poll_settings().unwrap(), PollSettings::default());
        assert_eq!(config.cdn_rewrite().unwrap(), CdnRewrite::None);
        assert_eq!(config.default_orientation().unwrap(), Orientation::Portrait);
        assert_eq!(config.credential_ceiling, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn blank_credentials_are_dropped() {
        let mut config = config();
        config.credentials = vec![" key-a ".to_string(), "".to_string(), "key-b".to_string()];
        assert_eq!(config.credential_secrets(), vec!["key-a", "key-b"]);
    }

    #[test]
    fn cdn_modes_need_a_base() {
        let mut config = config();
        config.cdn_rewrite_mode = "replace_host".to_string();
        assert!(config.cdn_rewrite().is_err());

        config.cdn_base_url = Some("https://cdn.example.net".to_string());
        assert_eq!(
            config.cdn_rewrite().unwrap(),
            CdnRewrite::ReplaceHost("https://cdn.example.net".to_string())
        );

        config.cdn_rewrite_mode = "mirror".to_string();
        assert!(config.cdn_rewrite().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let mut config = config();
        config.backoff_max_secs = 2;
        config.backoff_min_secs = 6;
        assert!(config.backoff_policy().is_err());
        assert!(config.validate().is_err());
    }
}
