use crate::close::CloseReason;
use crate::config::ConfigError;
use crate::snowflake::SnowflakeError;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// A lightweight copy of the error's category that callers can branch on
/// without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket, TLS or HTTP transport failure; retried through reconnect
    Transport,
    /// Malformed envelope or unknown opcode
    Protocol,
    /// The session cannot continue (rejected resume, auth failure)
    Session,
    /// Rate limited; only surfaced when retrying is impossible
    Throttle,
    /// Invalid configuration, raised at construction
    Configuration,
    /// The REST API answered with a non-success status
    Http,
    /// The manager or shard is stopping
    ShuttingDown,
}

/// Errors that can occur in ws-gateway
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection failed after all retry attempts
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },

    /// Timed out while connecting
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server sent an opcode outside the protocol
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u64),

    /// The server violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection closed for a reason that cannot be recovered
    #[error("Session closed: {0}")]
    SessionClosed(CloseReason),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid identifier
    #[error("Snowflake error: {0}")]
    Snowflake(#[from] SnowflakeError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The REST API answered with a non-success status
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Rate limited and the limiter could not schedule a retry
    #[error("Rate limited on {route}, retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: std::time::Duration,
    },

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// No shard with this id is running
    #[error("Unknown shard {0}")]
    UnknownShard(u32),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectTimeout(_)
            | Error::Http(_) => ErrorKind::Transport,
            Error::Json(_) | Error::UnknownOpcode(_) | Error::Protocol(_) => ErrorKind::Protocol,
            Error::SessionClosed(_) => ErrorKind::Session,
            Error::RateLimited { .. } => ErrorKind::Throttle,
            Error::Config(_) | Error::Snowflake(_) | Error::UnknownShard(_) => {
                ErrorKind::Configuration
            }
            Error::Api { .. } => ErrorKind::Http,
            Error::ShuttingDown | Error::ChannelSend(_) => ErrorKind::ShuttingDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::UnknownOpcode(99).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::SessionClosed(CloseReason::AuthenticationFailed).kind(),
            ErrorKind::Session
        );
        assert_eq!(Error::from(ConfigError::MissingToken).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::Api { status: 403, body: String::new() }.kind(),
            ErrorKind::Http
        );
        assert_eq!(Error::ShuttingDown.kind(), ErrorKind::ShuttingDown);
    }
}
