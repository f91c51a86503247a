//! Response types for The Things Stack Gateway Server API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Subset of `GET /api/v3/gs/gateways/{id}/connection/stats` we care about
///
/// The API encodes uint64 as JSON strings and omits zero values, so counts
/// accept both forms and default to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectionStats {
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub uplink_count: u64,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub downlink_count: u64,
    #[serde(default)]
    pub last_uplink_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_downlink_received_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(u64),
    String(String),
}

fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(n) => Ok(n),
        StringOrNumber::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
