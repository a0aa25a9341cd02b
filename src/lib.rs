//! # ws-gateway
//!
//! A sharded client for a chat platform's realtime websocket gateway, with a
//! bucketed REST rate limiter for commands.
//!
//! ## Features
//!
//! - **Sharding** with staggered identifies and one aggregate connected/disconnected signal
//! - **Session resume** after network loss, without losing or duplicating events
//! - **Zombie detection** via heartbeat acknowledgements
//! - **Auto-reconnection** with exponential backoff and full jitter
//! - **REST rate limiting** per route bucket, with transparent 429 retries
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway::{DispatchEvent, GatewayConfig, GatewayHandler, Intents, ShardManager};
//!
//! struct Bot;
//!
//! impl GatewayHandler for Bot {
//!     async fn on_event(&self, shard_id: u32, event: DispatchEvent) {
//!         // ...
//!     }
//! }
//!
//! let config = GatewayConfig::builder(Token::bot("..."))
//!     .intents(Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT)
//!     .shard_count(2)
//!     .build()?;
//!
//! let manager = ShardManager::new(config, Bot);
//! manager.connect().await?;
//! ```

mod close;
pub mod codec;
mod config;
mod connection;
pub mod dispatch;
mod error;
mod handler;
mod heartbeat;
mod manager;
mod metrics;
pub mod model;
pub mod payload;
mod ratelimit;
mod rest;
mod session;
mod shard;
pub mod snowflake;
mod token;

pub use close::CloseReason;
pub use codec::Timestamp;
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder,
    HeartbeatConfig, RestConfig, ShardInformation, API_VERSION, DEFAULT_API_BASE,
    DEFAULT_GATEWAY_URL,
};
pub use dispatch::{DispatchEvent, Ready};
pub use error::{Error, ErrorKind};
pub use handler::{GatewayHandler, ShardDelegate};
pub use heartbeat::{Beat, HeartbeatTracker};
pub use manager::ShardManager;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use payload::{GatewayCommand, GatewayEvent, Intents, Opcode, PresenceUpdate, Status};
pub use ratelimit::{RateLimitHeaders, RateLimiter, RestResponse, Route};
pub use rest::{
    CreateMessage, GatewayBotInfo, GatewayInfo, GetMessages, RestClient, SessionStartLimit,
};
pub use session::{Action, CloseOutcome, Session, ShardMachine, ShardState};
pub use snowflake::{Snowflake, SnowflakeError};
pub use token::Token;

// Re-export http types used by the rate limiter
pub use http::{HeaderMap, Method};

/// Result type for ws-gateway operations
pub type Result<T> = std::result::Result<T, Error>;
