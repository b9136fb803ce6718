use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::SessionOptions;

pub const BOT_TOKEN_ENV: &str = "BOT_TOKEN";
pub const WEBHOOK_URL_ENV: &str = "N8N_WEBHOOK_URL";

/// teloxide's default HTTP client gives up after 17s, so a long poll must
/// return before that.
pub const MAX_POLL_TIMEOUT_SECS: u64 = 16;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Dotted field paths tried in order for the reply text
    #[serde(default = "default_reply_paths")]
    pub reply_paths: Vec<String>,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// At most [`MAX_POLL_TIMEOUT_SECS`]
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LockConfig {
    /// Defaults to `bot.lock` next to the executable
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_reply_paths() -> Vec<String> {
    vec![
        "message".to_string(),
        "data.message".to_string(),
        "response.message".to_string(),
    ]
}

fn default_fallback_reply() -> String {
    "Message received".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_poll_timeout() -> u64 {
    10
}

fn default_restart_delay() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_webhook_timeout(),
            reply_paths: default_reply_paths(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            timeout_secs: default_poll_timeout(),
            restart_delay_secs: default_restart_delay(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl PollingConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.polling.timeout_secs <= MAX_POLL_TIMEOUT_SECS,
            "polling.timeout_secs = {} exceeds the {}s limit of the Telegram HTTP client",
            self.polling.timeout_secs,
            MAX_POLL_TIMEOUT_SECS
        );
        Ok(())
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(BOT_TOKEN_ENV) {
            self.telegram.bot_token = token;
        }
        if let Some(url) = lookup(WEBHOOK_URL_ENV) {
            self.webhook.url = url;
        }
    }

    /// Lock file location: explicit `[lock] path`, else next to the executable
    pub fn lock_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.lock.path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().context("Failed to resolve executable path")?;
        let dir = exe
            .parent()
            .context("Executable path has no parent directory")?;
        Ok(dir.join("bot.lock"))
    }
}
