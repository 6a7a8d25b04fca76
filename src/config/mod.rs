use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// WebSocket RPC endpoint used for the log subscription.
    pub ws_url: String,
    /// HTTP RPC endpoint used for `eth_call` balance reads.
    #[serde(default)]
    pub http_url: String,
    /// Stablecoin contract whose Transfer events are watched.
    #[serde(default = "default_token_address")]
    pub token_address: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Re-evaluation period while a subscription is open.
    #[serde(default = "default_fast_check")]
    pub fast_check_secs: u64,
    /// Re-evaluation period while idle.
    #[serde(default = "default_slow_check")]
    pub slow_check_secs: u64,
    /// Fixed delay before re-opening a subscription that dropped.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    /// Balance polling fallback period. 0 disables polling.
    #[serde(default)]
    pub poll_interval_secs: u64,
    /// Delay before the automatic recheck scheduled by a manual check.
    #[serde(default = "default_recheck_delay")]
    pub recheck_delay_secs: u64,
    /// TTL used when the front end does not pass one.
    #[serde(default = "default_window_minutes")]
    pub default_window_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValkeyConfig {
    #[serde(default = "default_valkey_url")]
    pub url: String,
    #[serde(default = "default_valkey_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Yield ranking endpoint returning `[{name, apy}]`.
    #[serde(default)]
    pub yield_url: String,
    /// Sponsored-transaction deployer service base URL.
    #[serde(default)]
    pub deployer_url: String,
    /// Account directory base URL (user records, smart accounts).
    #[serde(default)]
    pub accounts_url: String,
    /// Telegram bot token - loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub telegram_bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_token_address() -> String {
    // USDC on Base
    "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string()
}
fn default_token_decimals() -> u32 {
    6
}
fn default_fast_check() -> u64 {
    5
}
fn default_slow_check() -> u64 {
    30
}
fn default_reconnect_backoff() -> u64 {
    10
}
fn default_recheck_delay() -> u64 {
    30
}
fn default_window_minutes() -> u32 {
    30
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_valkey_prefix() -> String {
    "depmon".to_string()
}
fn default_api_bind() -> String {
    "127.0.0.1:8088".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fast_check_secs: default_fast_check(),
            slow_check_secs: default_slow_check(),
            reconnect_backoff_secs: default_reconnect_backoff(),
            poll_interval_secs: 0,
            recheck_delay_secs: default_recheck_delay(),
            default_window_minutes: default_window_minutes(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: default_valkey_url(),
            prefix: default_valkey_prefix(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            yield_url: String::new(),
            deployer_url: String::new(),
            accounts_url: String::new(),
            telegram_bot_token: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_api_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl MonitorConfig {
    pub fn fast_period(&self) -> Duration {
        Duration::from_secs(self.fast_check_secs.max(1))
    }

    pub fn slow_period(&self) -> Duration {
        Duration::from_secs(self.slow_check_secs.max(1))
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_delay_secs)
    }
}

impl ChainConfig {
    pub fn token(&self) -> Result<alloy::primitives::Address, ConfigError> {
        self.token_address.parse().map_err(|_| ConfigError::Invalid {
            field: "chain.token_address",
            value: self.token_address.clone(),
        })
    }

    /// HTTP JSON-RPC endpoint for `eth_call`. Falls back to the WebSocket
    /// URL with its scheme swapped when none is configured.
    pub fn http_rpc_url(&self) -> String {
        if !self.http_url.is_empty() {
            return self.http_url.clone();
        }
        if let Some(rest) = self.ws_url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = self.ws_url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            self.ws_url.clone()
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Secrets and endpoints with credentials never live in the file
        if let Ok(url) = std::env::var("CHAIN_WS_URL") {
            config.chain.ws_url = url;
        }
        if let Ok(url) = std::env::var("CHAIN_HTTP_URL") {
            config.chain.http_url = url;
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.services.telegram_bot_token = token;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            config.valkey.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build a config purely from environment variables (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_url = std::env::var("CHAIN_WS_URL")
            .map_err(|_| ConfigError::MissingEnv("CHAIN_WS_URL".to_string()))?;

        let config = Config {
            chain: ChainConfig {
                ws_url,
                http_url: std::env::var("CHAIN_HTTP_URL").unwrap_or_default(),
                token_address: std::env::var("TOKEN_ADDRESS")
                    .unwrap_or_else(|_| default_token_address()),
                token_decimals: default_token_decimals(),
            },
            monitor: MonitorConfig::default(),
            valkey: ValkeyConfig {
                url: std::env::var("VALKEY_URL").unwrap_or_else(|_| default_valkey_url()),
                prefix: default_valkey_prefix(),
            },
            services: ServicesConfig {
                yield_url: std::env::var("YIELD_URL").unwrap_or_default(),
                deployer_url: std::env::var("DEPLOYER_URL").unwrap_or_default(),
                accounts_url: std::env::var("ACCOUNTS_URL").unwrap_or_default(),
                telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            },
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup-time checks. Misconfiguration is the only fatal error class.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.chain.ws_url.starts_with("ws://") && !self.chain.ws_url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                field: "chain.ws_url",
                value: self.chain.ws_url.clone(),
            });
        }
        if self.chain.token_address.parse::<alloy::primitives::Address>().is_err() {
            return Err(ConfigError::Invalid {
                field: "chain.token_address",
                value: self.chain.token_address.clone(),
            });
        }
        if self.chain.token_decimals > 28 {
            return Err(ConfigError::Invalid {
                field: "chain.token_decimals",
                value: self.chain.token_decimals.to_string(),
            });
        }
        Ok(())
    }

    pub fn has_telegram(&self) -> bool {
        !self.services.telegram_bot_token.is_empty()
    }
}
