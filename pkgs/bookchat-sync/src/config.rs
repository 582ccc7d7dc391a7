use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

const ENV_PREFIX: &str = "BOOKCHAT_";

/// Configuration for the sync engine and its HTTP client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the REST API, without a trailing slash
    pub api_base_url: String,

    /// URL of the push channel endpoint
    pub ws_url: String,

    /// Page size used when pulling the conversation list (default: 100)
    pub conversation_page_size: u32,

    /// Upper bound on conversation list pages fetched per load (default: 10)
    pub max_conversation_pages: u32,

    /// Page size used when pulling a thread's messages (default: 50)
    pub message_page_size: u32,

    /// Full unread recomputation interval (default: 30s)
    #[serde(with = "duration_serde")]
    pub unread_refresh_interval: Duration,

    /// Delay before redialing a dropped push channel (default: 5s)
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Timeout applied to every REST call (default: 30s)
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            ws_url: "ws://localhost:8080/ws".to_string(),
            conversation_page_size: 100,
            max_conversation_pages: 10,
            message_page_size: 50,
            unread_refresh_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// `~/.bookchat/config.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".bookchat");
        path.push("config.json");
        path
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` (or the default path) if it exists, then apply
    /// `BOOKCHAT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.with_overrides(std::env::vars())
    }

    /// Apply `BOOKCHAT_*` overrides from `vars`. Unrelated keys are ignored.
    pub fn with_overrides<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "API_URL" => self.api_base_url = value.trim_end_matches('/').to_string(),
                "WS_URL" => self.ws_url = value,
                "CONVERSATION_PAGE_SIZE" => {
                    self.conversation_page_size = parse_number(&key, &value)?
                }
                "MESSAGE_PAGE_SIZE" => self.message_page_size = parse_number(&key, &value)?,
                "REFRESH_INTERVAL" => self.unread_refresh_interval = parse_duration(&key, &value)?,
                "RECONNECT_DELAY" => self.reconnect_delay = parse_duration(&key, &value)?,
                "REQUEST_TIMEOUT" => self.request_timeout = parse_duration(&key, &value)?,
                _ => continue,
            }
            debug!("Config override from {}", key);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.is_empty() {
            return Err(SyncError::Config("api_base_url is empty".to_string()));
        }
        if self.ws_url.is_empty() {
            return Err(SyncError::Config("ws_url is empty".to_string()));
        }
        if self.conversation_page_size == 0 || self.message_page_size == 0 {
            return Err(SyncError::Config("page sizes must be positive".to_string()));
        }
        if self.max_conversation_pages == 0 {
            return Err(SyncError::Config(
                "max_conversation_pages must be positive".to_string(),
            ));
        }
        if self.unread_refresh_interval.is_zero() || self.reconnect_delay.is_zero() {
            return Err(SyncError::Config("intervals must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} is not a number: {}", key, value)))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| SyncError::Config(format!("{} is not a duration ({}): {}", key, e, value)))
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
