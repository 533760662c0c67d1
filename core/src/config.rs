/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_MS: u64 = 2500;
const DEFAULT_DIRECTORY_POLL_MS: u64 = 5000;
const DEFAULT_MAX_CONTENT_LEN: usize = 4000;

/// Which incremental feed a live view uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// One WebSocket per view
    Push,
    /// Re-fetch the snapshot window on a fixed interval
    Poll,
}

impl std::str::FromStr for FeedMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "push" | "ws" | "websocket" => Ok(FeedMode::Push),
            "poll" | "pull" => Ok(FeedMode::Poll),
            other => Err(SyncError::Config(format!(
                "Unknown feed mode '{}' (expected push or poll)",
                other
            ))),
        }
    }
}

/// Reconnect behaviour for the push feed.
///
/// `max_attempts == 0` disables reconnecting: a dropped socket is logged and
/// the feed stops updating until the view is reopened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Backoff before reconnect attempt `attempt` (1-based), with up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL
    pub api_base: String,

    /// WebSocket base URL
    pub ws_base: String,

    /// Directory holding the local store
    pub data_dir: PathBuf,

    /// Incremental feed strategy for live views
    pub feed_mode: FeedMode,

    /// Poll feed interval
    pub poll_interval: Duration,

    /// Directory (conversation list) poll interval
    pub directory_poll_interval: Duration,

    /// Push feed reconnect policy
    pub reconnect: ReconnectPolicy,

    /// Optional per-request timeout (none by default)
    pub request_timeout: Option<Duration>,

    /// Longest accepted item content, in characters
    pub max_content_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            ws_base: "ws://127.0.0.1:8000".to_string(),
            data_dir: PathBuf::from(".chatsync"),
            feed_mode: FeedMode::Push,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            directory_poll_interval: Duration::from_millis(DEFAULT_DIRECTORY_POLL_MS),
            reconnect: ReconnectPolicy::default(),
            request_timeout: None,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
        }
    }
}

impl Config {
    /// Parse flags out of `args` (program name first) and return the config
    /// together with the remaining positional arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--api" => {
                    config.api_base = flag_value(args, i, flag)?.to_string();
                    i += 2;
                }
                "--ws" => {
                    config.ws_base = flag_value(args, i, flag)?.to_string();
                    i += 2;
                }
                "--data-dir" => {
                    config.data_dir = PathBuf::from(flag_value(args, i, flag)?);
                    i += 2;
                }
                "--mode" => {
                    config.feed_mode = flag_value(args, i, flag)?.parse()?;
                    i += 2;
                }
                "--poll-ms" => {
                    config.poll_interval = Duration::from_millis(parse_number(args, i, flag)?);
                    i += 2;
                }
                "--directory-poll-ms" => {
                    config.directory_poll_interval =
                        Duration::from_millis(parse_number(args, i, flag)?);
                    i += 2;
                }
                "--reconnect" => {
                    config.reconnect.max_attempts = parse_number(args, i, flag)?;
                    i += 2;
                }
                "--timeout-ms" => {
                    config.request_timeout =
                        Some(Duration::from_millis(parse_number(args, i, flag)?));
                    i += 2;
                }
                "--max-len" => {
                    config.max_content_len = parse_number(args, i, flag)?;
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(SyncError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, positional))
    }

    /// Env overrides (nice for scripts)
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CHATSYNC_API") {
            self.api_base = v;
        }
        if let Ok(v) = std::env::var("CHATSYNC_WS") {
            self.ws_base = v;
        }
        if let Ok(v) = std::env::var("CHATSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(mode) = std::env::var("CHATSYNC_MODE")
            .ok()
            .and_then(|s| s.parse::<FeedMode>().ok())
        {
            self.feed_mode = mode;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "API base must be an http(s) URL: {}",
                self.api_base
            )));
        }
        if !(self.ws_base.starts_with("ws://") || self.ws_base.starts_with("wss://")) {
            return Err(SyncError::Config(format!(
                "WebSocket base must be a ws(s) URL: {}",
                self.ws_base
            )));
        }
        if self.poll_interval.is_zero() || self.directory_poll_interval.is_zero() {
            return Err(SyncError::Config("Poll intervals must be non-zero".to_string()));
        }
        if self.max_content_len == 0 {
            return Err(SyncError::Config("--max-len must be positive".to_string()));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))
}

fn parse_number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    flag_value(args, i, flag)?
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number", flag)))
}
