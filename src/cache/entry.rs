//! Cache Entry Encoding
//!
//! Two on-substrate shapes:
//!
//! - **TTL mode**: the bare JSON value, physically expiring. The empty
//!   string is the null marker for an entity known to be absent.
//! - **Logical-expire mode**: `{"data": <value>, "expireTime": <RFC 3339>}`
//!   with no physical TTL. The key never disappears; staleness is decided by
//!   comparing `expireTime` with the clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Value cached for an entity known to be absent from the source of truth.
pub const NULL_MARKER: &str = "";

/// Envelope stored for logically expiring entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEnvelope<T> {
    pub data: T,
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEnvelope<T> {
    pub fn new(data: T, now: DateTime<Utc>, ttl: Duration) -> Self {
        let expire_time = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { data, expire_time }
    }

    /// Still fresh at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expire_time > now
    }
}

impl<T: Serialize> LogicalEnvelope<T> {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> LogicalEnvelope<T> {
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A decoded TTL-mode entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue<T> {
    /// Entity present
    Present(T),
    /// Null marker: the entity is known not to exist
    Absent,
}

impl<T: DeserializeOwned> CachedValue<T> {
    pub fn decode(raw: &str) -> Result<Self> {
        if raw == NULL_MARKER {
            return Ok(CachedValue::Absent);
        }
        Ok(CachedValue::Present(serde_json::from_str(raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    #[test]
    fn test_envelope_wire_shape() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let env = LogicalEnvelope::new(
            Shop {
                id: 1,
                name: "tea house".into(),
            },
            now,
            Duration::from_secs(60),
        );
        let json = env.encode().unwrap();
        assert!(json.contains("\"expireTime\":\"2024-01-01T00:01:00Z\""));
        assert!(json.contains("\"data\":{\"id\":1"));

        let back: LogicalEnvelope<Shop> = LogicalEnvelope::decode(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_freshness_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let env = LogicalEnvelope::new(1u8, now, Duration::from_secs(10));
        assert!(env.is_fresh(now));
        assert!(!env.is_fresh(env.expire_time));
    }

    #[test]
    fn test_null_marker_decodes_as_absent() {
        assert_eq!(CachedValue::<Shop>::decode("").unwrap(), CachedValue::Absent);
        assert!(CachedValue::<Shop>::decode("{broken").is_err());
    }
}
