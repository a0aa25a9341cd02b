//! Wire-level value encoding shared by gateway payloads and REST bodies.
//!
//! The platform sends timestamps as RFC 3339 strings, sometimes with and
//! sometimes without fractional seconds, and sends some integers as strings
//! when they would overflow a double. Everything here accepts both shapes and
//! always emits the canonical one.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A point in time as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Wrap a UTC instant
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// The current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// The wrapped instant
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Parse either `2021-03-04T05:06:07Z` or `2021-03-04T05:06:07.123456+00:00`
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Canonical form, always with millisecond fractional seconds
    pub fn to_wire(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Timestamp::parse(&raw)
            .map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}

/// Serde adapter for `u64` fields the server may send as a JSON string.
///
/// Use with `#[serde(with = "crate::codec::string_or_u64")]`. Serializes as a
/// plain number.
pub mod string_or_u64 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(FlexibleU64)
    }

    struct FlexibleU64;

    impl Visitor<'_> for FlexibleU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an unsigned integer or a string holding one")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

/// Like [`string_or_u64`] for optional fields that may be absent or `null`.
///
/// Pair with `#[serde(default)]`.
pub mod option_string_or_u64 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::string_or_u64")] u64);

        Option::<Wrapper>::deserialize(deserializer).map(|w| w.map(|Wrapper(v)| v))
    }
}

/// Encode a value as compact JSON text
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// Decode a value from JSON text
pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_accepts_both_forms() {
        let whole = Timestamp::parse("2021-03-04T05:06:07Z").unwrap();
        let fractional = Timestamp::parse("2021-03-04T05:06:07.000000+00:00").unwrap();
        assert_eq!(whole, fractional);

        let offset = Timestamp::parse("2021-03-04T07:06:07.250+02:00").unwrap();
        assert_eq!(
            offset.as_datetime(),
            Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_timestamp_always_emits_fraction() {
        let ts = Timestamp::parse("2021-03-04T05:06:07Z").unwrap();
        assert_eq!(ts.to_wire(), "2021-03-04T05:06:07.000Z");
        assert_eq!(
            serde_json::to_string(&ts).unwrap(),
            "\"2021-03-04T05:06:07.000Z\""
        );
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
        assert!(serde_json::from_str::<Timestamp>("12").is_err());
    }

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Counters {
        #[serde(with = "string_or_u64")]
        total: u64,
        #[serde(default, with = "option_string_or_u64")]
        maybe: Option<u64>,
    }

    #[test]
    fn test_string_or_number_fields() {
        let a: Counters = serde_json::from_str(r#"{"total":"42","maybe":"7"}"#).unwrap();
        let b: Counters = serde_json::from_str(r#"{"total":42,"maybe":7}"#).unwrap();
        assert_eq!(a, b);

        let c: Counters = serde_json::from_str(r#"{"total":1}"#).unwrap();
        assert_eq!(c.maybe, None);
        let d: Counters = serde_json::from_str(r#"{"total":1,"maybe":null}"#).unwrap();
        assert_eq!(d.maybe, None);

        assert!(serde_json::from_str::<Counters>(r#"{"total":"4x2"}"#).is_err());
        assert_eq!(encode(&a).unwrap(), r#"{"total":42,"maybe":7}"#);
    }
}
