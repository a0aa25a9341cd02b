use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Milliseconds between the Unix epoch and the platform epoch (2015-01-01T00:00:00Z).
pub const EPOCH_MILLIS: i64 = 1_420_070_400_000;

/// Number of bits below the timestamp field.
const TIMESTAMP_SHIFT: u32 = 22;

/// Width of the timestamp field.
const TIMESTAMP_BITS: u32 = 41;

/// Errors produced while building identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnowflakeError {
    /// The input was not an unsigned decimal integer
    #[error("Invalid snowflake '{0}': not an unsigned integer")]
    Parse(String),
    /// The instant precedes the platform epoch
    #[error("Instant {0} precedes the snowflake epoch")]
    BeforeEpoch(DateTime<Utc>),
    /// The instant does not fit in the 41-bit timestamp field
    #[error("Instant {0} is beyond the 41-bit snowflake window")]
    BeyondWindow(DateTime<Utc>),
}

/// A 64-bit identifier that embeds its creation time.
///
/// Layout, most significant bit first:
///
/// ```text
/// | 41 bits: ms since epoch | 5 bits: worker | 5 bits: process | 12 bits: increment |
/// ```
///
/// Identifiers are ordered by their raw value, which matches creation order.
/// On the wire they travel as decimal strings but are accepted as integers too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Snowflake(u64);

impl Snowflake {
    /// Wrap a raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Milliseconds since the platform epoch
    pub const fn epoch_millis(self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    /// Creation time, millisecond precision
    pub fn timestamp(self) -> DateTime<Utc> {
        let millis = EPOCH_MILLIS + self.epoch_millis() as i64;
        // 41 bits of millis past 2015 always lands inside chrono's range
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Internal worker that generated the id
    pub const fn worker_id(self) -> u8 {
        ((self.0 & 0x3E_0000) >> 17) as u8
    }

    /// Internal process that generated the id
    pub const fn process_id(self) -> u8 {
        ((self.0 & 0x1_F000) >> 12) as u8
    }

    /// Per-process counter within the millisecond
    pub const fn increment(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    /// Build a synthetic identifier that would have been created at `instant`.
    ///
    /// Worker, process and increment are zero, so the result sorts before every
    /// real identifier minted in the same millisecond. Used for `before`/`after`
    /// pagination by time.
    pub fn from_timestamp(instant: DateTime<Utc>) -> Result<Self, SnowflakeError> {
        let since_epoch = instant.timestamp_millis() - EPOCH_MILLIS;
        if since_epoch < 0 {
            return Err(SnowflakeError::BeforeEpoch(instant));
        }
        if since_epoch >= (1i64 << TIMESTAMP_BITS) {
            return Err(SnowflakeError::BeyondWindow(instant));
        }
        Ok(Self((since_epoch as u64) << TIMESTAMP_SHIFT))
    }
}

impl From<u64> for Snowflake {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Snowflake> for u64 {
    fn from(id: Snowflake) -> Self {
        id.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = SnowflakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // u64::from_str accepts a leading '+', the wire format never carries one
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SnowflakeError::Parse(s.to_string()));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| SnowflakeError::Parse(s.to_string()))
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Snowflake(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(Snowflake)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

/// Identifier of a guild
pub type GuildId = Snowflake;
/// Identifier of a channel
pub type ChannelId = Snowflake;
/// Identifier of a user
pub type UserId = Snowflake;
/// Identifier of a message
pub type MessageId = Snowflake;
/// Identifier of a role
pub type RoleId = Snowflake;
/// Identifier of an emoji
pub type EmojiId = Snowflake;
/// Identifier of a webhook
pub type WebhookId = Snowflake;
/// Identifier of an application
pub type ApplicationId = Snowflake;
/// Identifier of an interaction
pub type InteractionId = Snowflake;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_known_identifier_fields() {
        let id: Snowflake = "175928847299117063".parse().unwrap();
        assert_eq!(id.timestamp().timestamp_millis(), 1_462_015_105_796);
        assert_eq!(id.worker_id(), 1);
        assert_eq!(id.process_id(), 0);
        assert_eq!(id.increment(), 7);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert!("".parse::<Snowflake>().is_err());
        assert!("abc".parse::<Snowflake>().is_err());
        assert!("-1".parse::<Snowflake>().is_err());
        assert!("+1".parse::<Snowflake>().is_err());
        assert!("18446744073709551616".parse::<Snowflake>().is_err());
    }

    #[test]
    fn test_from_timestamp_bounds() {
        let epoch = Utc.timestamp_millis_opt(EPOCH_MILLIS).unwrap();
        assert_eq!(Snowflake::from_timestamp(epoch).unwrap().get(), 0);

        let before = epoch - Duration::milliseconds(1);
        assert!(matches!(
            Snowflake::from_timestamp(before),
            Err(SnowflakeError::BeforeEpoch(_))
        ));

        let last = epoch + Duration::milliseconds((1i64 << 41) - 1);
        assert!(Snowflake::from_timestamp(last).is_ok());

        let beyond = epoch + Duration::milliseconds(1i64 << 41);
        assert!(matches!(
            Snowflake::from_timestamp(beyond),
            Err(SnowflakeError::BeyondWindow(_))
        ));
    }

    #[test]
    fn test_ordering_follows_creation_time() {
        let earlier = Utc.timestamp_millis_opt(1_600_000_000_000).unwrap();
        let later = earlier + Duration::seconds(1);
        let a = Snowflake::from_timestamp(earlier).unwrap();
        let b = Snowflake::from_timestamp(later).unwrap();
        assert!(a < b);
        // A real id from the same millisecond sorts after the synthetic one
        assert!(a < Snowflake::new(a.get() | 0x1_0001));
    }

    #[test]
    fn test_serde_accepts_string_and_integer() {
        let from_str: Snowflake = serde_json::from_str("\"80351110224678912\"").unwrap();
        let from_int: Snowflake = serde_json::from_str("80351110224678912").unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(
            serde_json::to_string(&from_int).unwrap(),
            "\"80351110224678912\""
        );
        assert!(serde_json::from_str::<Snowflake>("\"12ab\"").is_err());
        assert!(serde_json::from_str::<Snowflake>("-5").is_err());
    }

    proptest! {
        #[test]
        fn prop_string_round_trip(raw in any::<u64>()) {
            let id = Snowflake::new(raw);
            prop_assert_eq!(id.to_string().parse::<Snowflake>().unwrap(), id);
        }

        #[test]
        fn prop_timestamp_recovers_instant(offset in 0i64..(1i64 << 41), nanos in 0u32..1_000_000) {
            let millis = EPOCH_MILLIS + offset;
            let instant = Utc.timestamp_millis_opt(millis).unwrap()
                + Duration::nanoseconds(nanos as i64);
            let id = Snowflake::from_timestamp(instant).unwrap();
            prop_assert_eq!(id.timestamp().timestamp_millis(), millis);
        }
    }
}
