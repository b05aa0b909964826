//! Core types for Stowage
//!
//! Defines the data shapes a key can hold, TTL reporting, and the
//! millisecond clock used for expiry bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreError;

/// The value structure held by a key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    String,
    Hash,
    List,
    Set,
}

impl Shape {
    /// Tag stored in the key metadata and reported by Redis `TYPE`
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::String => "string",
            Shape::Hash => "hash",
            Shape::List => "list",
            Shape::Set => "set",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shape {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Shape::String),
            "hash" => Ok(Shape::Hash),
            "list" => Ok(Shape::List),
            "set" => Ok(Shape::Set),
            other => Err(StoreError::storage(format!("unknown shape tag '{}'", other))),
        }
    }
}

/// Remaining lifetime of a key
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ttl {
    /// Key expires in this many seconds
    Remaining(u64),
    /// Key exists without an expiry
    NoExpiry,
    /// Key does not exist
    Missing,
}

impl Ttl {
    /// Conventional integer code: seconds remaining, -1 or -2
    pub fn as_code(&self) -> i64 {
        match self {
            Ttl::Remaining(secs) => *secs as i64,
            Ttl::NoExpiry => -1,
            Ttl::Missing => -2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            -1 => Ttl::NoExpiry,
            c if c < 0 => Ttl::Missing,
            c => Ttl::Remaining(c as u64),
        }
    }

    /// Round a millisecond remainder to whole seconds the way Redis does
    pub fn from_remaining_millis(millis: i64) -> Self {
        Ttl::Remaining(((millis.max(0) + 500) / 1000) as u64)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Remaining(secs) => write!(f, "{}s", secs),
            Ttl::NoExpiry => write!(f, "no expiry"),
            Ttl::Missing => write!(f, "missing"),
        }
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn plus(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }

    /// Expired means the deadline is at or before `now`
    pub fn has_passed(&self, now: Timestamp) -> bool {
        self.0 <= now.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Validate a relative expiry given in seconds
pub fn expiry_seconds(seconds: i64) -> Result<Duration, StoreError> {
    if seconds < 0 {
        return Err(StoreError::validation(format!(
            "expire seconds must not be negative, got {}",
            seconds
        )));
    }
    Ok(Duration::from_secs(seconds as u64))
}

/// Validate a TTL passed to `set`; a zero TTL would store an already dead key
pub fn set_ttl(ttl: Option<Duration>) -> Result<Option<Duration>, StoreError> {
    match ttl {
        Some(d) if d.is_zero() => Err(StoreError::validation("ttl must be greater than zero")),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_tags() {
        for shape in [Shape::String, Shape::Hash, Shape::List, Shape::Set] {
            assert_eq!(shape.as_str().parse::<Shape>().unwrap(), shape);
        }
        assert!("zset".parse::<Shape>().is_err());
    }

    #[test]
    fn test_ttl_codes() {
        assert_eq!(Ttl::Missing.as_code(), -2);
        assert_eq!(Ttl::NoExpiry.as_code(), -1);
        assert_eq!(Ttl::Remaining(30).as_code(), 30);
        assert_eq!(Ttl::from_code(-1), Ttl::NoExpiry);
        assert_eq!(Ttl::from_code(-2), Ttl::Missing);
        assert_eq!(Ttl::from_code(12), Ttl::Remaining(12));
    }

    #[test]
    fn test_ttl_rounding() {
        assert_eq!(Ttl::from_remaining_millis(9_600), Ttl::Remaining(10));
        assert_eq!(Ttl::from_remaining_millis(9_400), Ttl::Remaining(9));
        assert_eq!(Ttl::from_remaining_millis(-5), Ttl::Remaining(0));
    }

    #[test]
    fn test_timestamp_deadline() {
        let now = Timestamp::from_millis(10_000);
        let deadline = now.plus(Duration::from_secs(1));
        assert_eq!(deadline.as_millis(), 11_000);
        assert!(!deadline.has_passed(now));
        assert!(deadline.has_passed(Timestamp::from_millis(11_000)));
    }

    #[test]
    fn test_ttl_validation() {
        assert!(expiry_seconds(-1).is_err());
        assert_eq!(expiry_seconds(5).unwrap(), Duration::from_secs(5));
        assert!(set_ttl(Some(Duration::ZERO)).is_err());
        assert_eq!(set_ttl(None).unwrap(), None);
    }
}
