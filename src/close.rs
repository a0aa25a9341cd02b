use std::fmt;

/// Why a gateway connection closed.
///
/// Built from the websocket close code (or a local condition) and consumed by
/// the shard state machine to decide between resuming, re-identifying and
/// stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No close code was available
    Unknown,
    /// The network dropped underneath the socket
    NoNetwork,
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 4000
    UnknownError,
    /// 4001: the server did not recognise an opcode we sent
    UnknownOpcode,
    /// 4002: the server could not decode a payload we sent
    DecodeError,
    /// 4003: a payload was sent before identifying
    NotAuthenticated,
    /// 4004: the token was rejected
    AuthenticationFailed,
    /// 4005: identify was sent twice
    AlreadyAuthenticated,
    /// 4007: the sequence sent when resuming was invalid
    InvalidSequence,
    /// 4008: payloads were sent too quickly
    RateLimited,
    /// 4009: the session timed out (also used locally for zombied connections)
    SessionTimeout,
    /// 4010: the shard pair sent when identifying was invalid
    InvalidShard,
    /// 4011: the account needs more shards
    ShardingRequired,
    /// 4012: the gateway version is not supported
    UnknownProtocol,
    /// 4013: the intents bitmask was invalid
    InvalidIntents,
    /// 4014: disconnected by the server (disallowed intents, kicked from voice)
    Disconnected,
    /// 4015: the voice server crashed
    VoiceServerCrash,
    /// 4016: unknown voice encryption mode
    UnknownEncryptionMode,
    /// Any code outside the taxonomy
    Other(u16),
}

impl CloseReason {
    /// Map a numeric close code
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::Unknown,
            50 => Self::NoNetwork,
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimeout,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::UnknownProtocol,
            4013 => Self::InvalidIntents,
            4014 => Self::Disconnected,
            4015 => Self::VoiceServerCrash,
            4016 => Self::UnknownEncryptionMode,
            other => Self::Other(other),
        }
    }

    /// Numeric code of this reason
    pub fn code(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::NoNetwork => 50,
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::UnknownError => 4000,
            Self::UnknownOpcode => 4001,
            Self::DecodeError => 4002,
            Self::NotAuthenticated => 4003,
            Self::AuthenticationFailed => 4004,
            Self::AlreadyAuthenticated => 4005,
            Self::InvalidSequence => 4007,
            Self::RateLimited => 4008,
            Self::SessionTimeout => 4009,
            Self::InvalidShard => 4010,
            Self::ShardingRequired => 4011,
            Self::UnknownProtocol => 4012,
            Self::InvalidIntents => 4013,
            Self::Disconnected => 4014,
            Self::VoiceServerCrash => 4015,
            Self::UnknownEncryptionMode => 4016,
            Self::Other(code) => code,
        }
    }

    /// Reconnecting cannot help: the configuration or credentials are wrong.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::UnknownProtocol
                | Self::InvalidIntents
                | Self::Disconnected
        )
    }

    /// The stored session may be resumed after this close.
    ///
    /// Fatal reasons never resume. An invalid sequence, or a close that says
    /// we never finished authenticating, forces a fresh identify.
    pub fn is_resumable(self) -> bool {
        !self.is_fatal()
            && !matches!(
                self,
                Self::InvalidSequence | Self::NotAuthenticated | Self::AlreadyAuthenticated
            )
    }
}

impl From<u16> for CloseReason {
    fn from(code: u16) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [0u16, 50, 1000, 1001, 4000, 4001, 4002, 4003, 4004, 4005, 4007, 4008, 4009, 4010, 4011, 4012, 4013, 4014, 4015, 4016, 4999] {
            assert_eq!(CloseReason::from_code(code).code(), code);
        }
        assert_eq!(CloseReason::from_code(4006), CloseReason::Other(4006));
    }

    #[test]
    fn test_resumability_classification() {
        assert!(CloseReason::Unknown.is_resumable());
        assert!(CloseReason::NoNetwork.is_resumable());
        assert!(CloseReason::GoingAway.is_resumable());
        assert!(CloseReason::RateLimited.is_resumable());
        assert!(CloseReason::SessionTimeout.is_resumable());

        assert!(!CloseReason::InvalidSequence.is_resumable());
        assert!(!CloseReason::InvalidSequence.is_fatal());

        for fatal in [
            CloseReason::AuthenticationFailed,
            CloseReason::InvalidShard,
            CloseReason::ShardingRequired,
            CloseReason::UnknownProtocol,
            CloseReason::InvalidIntents,
            CloseReason::Disconnected,
        ] {
            assert!(fatal.is_fatal());
            assert!(!fatal.is_resumable());
        }
    }
}
