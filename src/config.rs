use crate::payload::Intents;
use crate::token::Token;
use std::ops::Range;
use std::time::Duration;

/// Default gateway URL, used when `/gateway` is not consulted
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Default REST base URL
pub const DEFAULT_API_BASE: &str = "https://discord.com/api";

/// Gateway and REST API version spoken by this crate
pub const API_VERSION: u8 = 10;

/// Configuration for the gateway shards
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Authentication token
    pub token: Token,
    /// Gateway base URL, without query string
    pub gateway_url: String,
    /// Gateway protocol version
    pub api_version: u8,
    /// Event groups to subscribe to
    pub intents: Intents,
    /// Member count above which guilds are sent without offline members (50..=250)
    pub large_threshold: Option<u8>,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Shards this process runs; `None` runs every shard of `shard_count`
    pub shards: Option<ShardInformation>,
    /// Total shard count when `shards` is not given
    pub shard_count: u32,
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<Token>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                gateway_url: DEFAULT_GATEWAY_URL.to_string(),
                api_version: API_VERSION,
                intents: Intents::default(),
                large_threshold: None,
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                shards: None,
                shard_count: 1,
            },
        }
    }

    /// The shard range and total this process runs
    pub fn shard_information(&self) -> ShardInformation {
        self.shards.clone().unwrap_or(ShardInformation {
            range: 0..self.shard_count,
            total: self.shard_count,
        })
    }

    /// Full websocket URL including version and encoding
    pub fn connect_url(&self) -> String {
        self.connect_url_for(&self.gateway_url)
    }

    /// Like [`connect_url`](Self::connect_url) for another base, such as a
    /// session's resume URL
    pub fn connect_url_for(&self, base: &str) -> String {
        format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.api_version
        )
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the gateway base URL
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = url.into();
        self
    }

    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn large_threshold(mut self, threshold: u8) -> Self {
        self.config.large_threshold = Some(threshold);
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set heartbeat configuration
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    /// Run every shard of `count`
    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = count;
        self.config.shards = None;
        self
    }

    /// Run only the shards in `info`
    pub fn shards(mut self, info: ShardInformation) -> Self {
        self.config.shard_count = info.total;
        self.config.shards = Some(info);
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        if self.config.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        self.config.backoff.validate()?;

        if self.config.connection.max_connect_attempts == 0 {
            return Err(ConfigError::InvalidConnection(
                "max_connect_attempts cannot be 0".to_string(),
            ));
        }

        if self.config.heartbeat.max_missed_acks == 0 {
            return Err(ConfigError::InvalidHeartbeat(
                "max_missed_acks cannot be 0".to_string(),
            ));
        }

        if let Some(threshold) = self.config.large_threshold {
            if !(50..=250).contains(&threshold) {
                return Err(ConfigError::InvalidConnection(format!(
                    "large_threshold must be within 50..=250, got {}",
                    threshold
                )));
            }
        }

        if self.config.shard_count == 0 {
            return Err(ConfigError::InvalidShardRange {
                start: 0,
                end: 0,
                total: 0,
            });
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Shard range not contained in `[0, total)`
    #[error("Invalid shard range {start}..{end} for {total} total shards")]
    InvalidShardRange { start: u32, end: u32, total: u32 },
    /// No token given
    #[error("Token is empty")]
    MissingToken,
    /// A URL could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// The shards one process is responsible for.
///
/// `range` is the set of shard indices to run and `total` the shard count the
/// whole account is split into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInformation {
    range: Range<u32>,
    total: u32,
}

impl ShardInformation {
    /// Validates that `range` is non-empty and within `[0, total)`
    pub fn new(range: Range<u32>, total: u32) -> Result<Self, ConfigError> {
        if range.is_empty() || range.end > total {
            return Err(ConfigError::InvalidShardRange {
                start: range.start,
                end: range.end,
                total,
            });
        }
        Ok(Self { range, total })
    }

    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Number of shards in the range
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Shard indices in ascending order
    pub fn shard_ids(&self) -> impl Iterator<Item = u32> {
        self.range.clone()
    }
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Maximum number of consecutive connection attempts before giving up
    pub max_connect_attempts: u32,
    /// Delay between starting consecutive shards
    pub identify_stagger: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 10,
            identify_stagger: Duration::from_secs(5),
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: uniform in [0, capped]
            Duration::from_millis((rand::random::<f64>() * capped) as u64)
        } else {
            Duration::from_millis(capped as u64)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        if self.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Heartbeats that may go unacknowledged before the connection is
    /// considered zombied. 1 closes as soon as a beat is due while the
    /// previous one is still unacknowledged.
    pub max_missed_acks: u32,
    /// Delay the first beat by a random fraction of the interval
    pub jitter_first_beat: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_missed_acks: 1,
            jitter_first_beat: true,
        }
    }
}

/// REST client configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// API base URL, without version segment
    pub base_url: String,
    pub api_version: u8,
    pub user_agent: String,
    /// Timeout for one HTTP exchange (not counting rate-limit waits)
    pub request_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_version: API_VERSION,
            user_agent: format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RestConfig {
    /// Base URL with the version segment, e.g. `https://discord.com/api/v10`
    pub fn versioned_base(&self) -> String {
        format!("{}/v{}", self.base_url.trim_end_matches('/'), self.api_version)
    }
}
