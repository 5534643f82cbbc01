//! Settings - TOML 設定
//!
//! どのキーも省略可能で、省略時は既定値になります。
//! ファイルを渡さなければ全て既定値です。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub long_poll: LongPollSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let settings: Self = toml::from_str(&data)?;
                Ok(settings)
            }
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token; requests go out unauthenticated when unset.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_offline_pause_ms")]
    pub offline_pause_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl QueueSettings {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn offline_pause(&self) -> Duration {
        Duration::from_millis(self.offline_pause_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            idle_poll_ms: default_idle_poll_ms(),
            offline_pause_ms: default_offline_pause_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".tabsync")
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_offline_pause_ms() -> u64 {
    1_500
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LongPollSettings {
    /// Server-side wait budget per request.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_retry_after_ms")]
    pub default_retry_after_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl LongPollSettings {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
            client_timeout_ms: default_client_timeout_ms(),
            default_retry_after_ms: default_retry_after_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_wait_secs() -> u64 {
    25
}

fn default_client_timeout_ms() -> u64 {
    30_000
}

fn default_retry_after_ms() -> u64 {
    800
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
