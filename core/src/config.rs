/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Page size used for every paged fetch
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Reconnection schedule in milliseconds; the last entry repeats
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 4] = [0, 2000, 5000, 10000];

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Conversation opened by the binary (library callers pass it explicitly)
    pub conversation_id: Option<String>,

    /// Base URL of the REST API, without trailing slash
    pub api_base_url: String,

    /// Push hub URL (ws:// or wss://)
    pub push_url: String,

    /// Local user id stamped on optimistic messages
    pub sender_id: Option<String>,

    /// Messages requested per page
    pub page_size: usize,

    /// Delay before each reconnect attempt, clamped to the last entry
    pub reconnect_delays: Vec<Duration>,

    /// Give up reconnecting after this many attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,

    /// Push handshake timeout
    pub handshake_timeout: Duration,

    /// Client ping interval on the push connection
    pub keepalive_interval: Duration,

    /// Silence on the push connection longer than this counts as a drop
    pub server_timeout: Duration,

    /// REST request timeout
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversation_id: None,
            api_base_url: "http://127.0.0.1:5000/api".to_string(),
            push_url: "ws://127.0.0.1:5000/hubs/chat".to_string(),
            sender_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            reconnect_delays: DEFAULT_RECONNECT_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            max_reconnect_attempts: None,
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <conversation_id> [--api-url <url>] [--push-url <url>] [--sender <id>] [--max-retries <n>]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let mut config = Self::default();
        let mut conversation_id: Option<String> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_base_url = flag_value(args, i, "--api-url")?;
                    i += 2;
                }
                "--push-url" => {
                    config.push_url = flag_value(args, i, "--push-url")?;
                    i += 2;
                }
                "--sender" => {
                    config.sender_id = Some(flag_value(args, i, "--sender")?);
                    i += 2;
                }
                "--max-retries" => {
                    let n = flag_value(args, i, "--max-retries")?;
                    config.max_reconnect_attempts = Some(n.parse::<u32>().map_err(|_| {
                        ChatError::Config("--max-retries must be a non-negative number".to_string())
                    })?);
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    if conversation_id.is_some() {
                        return Err(ChatError::Config(format!(
                            "Unexpected argument: {}",
                            other
                        )));
                    }
                    conversation_id = Some(other.to_string());
                    i += 1;
                }
            }
        }

        config.conversation_id = conversation_id;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(url) = std::env::var("CHATSYNC_PUSH_URL") {
            self.push_url = url;
        }
        if let Ok(sender) = std::env::var("CHATSYNC_SENDER") {
            self.sender_id = Some(sender);
        }
        if let Some(n) = std::env::var("CHATSYNC_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.max_reconnect_attempts = Some(n);
        }
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(ChatError::Config("page_size must be at least 1".to_string()));
        }
        if self.reconnect_delays.is_empty() {
            return Err(ChatError::Config(
                "reconnect_delays must contain at least one delay".to_string(),
            ));
        }
        if !(self.push_url.starts_with("ws://") || self.push_url.starts_with("wss://")) {
            return Err(ChatError::Config(format!(
                "push_url must be a ws:// or wss:// URL, got {}",
                self.push_url
            )));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(ChatError::Config(format!(
                "api_base_url must be an http(s) URL, got {}",
                self.api_base_url
            )));
        }
        Ok(())
    }
}

fn flag_value(args: &[String], i: usize, flag: &str) -> Result<String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}
