//! Fixed topic layout and value encoding
//!
//! ```text
//! {prefix}/local/{rx_total,tx_total,connected,last_update}
//! {prefix}/ttn/{uplink_count,downlink_count,last_uplink_received_at,
//!               last_downlink_received_at,connected,last_update}
//! {prefix}/status   online | offline
//! ```
//!
//! Every field is its own topic so subscribers can pick a subset.

use crate::stats::{CounterState, RemoteStatus};
use chrono::{DateTime, SecondsFormat, Utc};

pub const LOCAL_GROUP: &str = "local";
pub const REMOTE_GROUP: &str = "ttn";
pub const STATUS_TOPIC: &str = "status";

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";
/// Payload for a count the network server has not reported (yet)
pub const UNKNOWN: &str = "unknown";

/// One retained value on one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn status(&self) -> String {
        format!("{}/{}", self.prefix, STATUS_TOPIC)
    }

    fn topic(&self, group: &str, field: &str) -> String {
        format!("{}/{}/{}", self.prefix, group, field)
    }

    fn message(&self, group: &str, field: &str, payload: String) -> Message {
        Message {
            topic: self.topic(group, field),
            payload,
        }
    }

    /// The local group, all four values from the same snapshot
    pub fn local_group(
        &self,
        counters: &CounterState,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        vec![
            self.message(LOCAL_GROUP, "rx_total", counters.rx_total.to_string()),
            self.message(LOCAL_GROUP, "tx_total", counters.tx_total.to_string()),
            self.message(LOCAL_GROUP, "connected", encode_bool(connected)),
            self.message(LOCAL_GROUP, "last_update", encode_time(Some(now))),
        ]
    }

    /// The network-server group. Counts never polled successfully are
    /// published as `unknown`, unset timestamps as an empty payload.
    pub fn remote_group(
        &self,
        status: &RemoteStatus,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        vec![
            self.message(REMOTE_GROUP, "uplink_count", encode_count(status.uplink_count)),
            self.message(
                REMOTE_GROUP,
                "downlink_count",
                encode_count(status.downlink_count),
            ),
            self.message(
                REMOTE_GROUP,
                "last_uplink_received_at",
                encode_time(status.last_uplink_at),
            ),
            self.message(
                REMOTE_GROUP,
                "last_downlink_received_at",
                encode_time(status.last_downlink_at),
            ),
            self.message(REMOTE_GROUP, "connected", encode_bool(connected)),
            self.message(REMOTE_GROUP, "last_update", encode_time(Some(now))),
        ]
    }
}

fn encode_bool(value: bool) -> String {
    let encoded = if value { "1" } else { "0" };
    encoded.to_string()
}

fn encode_count(value: Option<u64>) -> String {
    value.map_or_else(|| UNKNOWN.to_string(), |n| n.to_string())
}

fn encode_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 7, 10, 40, 12).unwrap()
    }

    fn payload<'a>(messages: &'a [Message], topic: &str) -> &'a str {
        messages
            .iter()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.as_str())
            .unwrap_or_else(|| panic!("missing topic {topic}"))
    }

    #[test]
    fn test_local_group_has_exactly_four_fields() {
        let layout = TopicLayout::new("gateways/");
        let counters = CounterState {
            rx_total: 3,
            tx_total: 1,
            last_rx_at: Some(t0()),
        };
        let messages = layout.local_group(&counters, true, t0());

        let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "gateways/local/rx_total",
                "gateways/local/tx_total",
                "gateways/local/connected",
                "gateways/local/last_update",
            ]
        );
        assert_eq!(payload(&messages, "gateways/local/rx_total"), "3");
        assert_eq!(payload(&messages, "gateways/local/tx_total"), "1");
        assert_eq!(payload(&messages, "gateways/local/connected"), "1");
        assert_eq!(
            payload(&messages, "gateways/local/last_update"),
            "2025-12-07T10:40:12.000Z"
        );
    }

    #[test]
    fn test_remote_group_unknown_before_first_poll() {
        let layout = TopicLayout::new("gw");
        let messages = layout.remote_group(&RemoteStatus::default(), false, t0());

        assert_eq!(messages.len(), 6);
        assert_eq!(payload(&messages, "gw/ttn/uplink_count"), UNKNOWN);
        assert_eq!(payload(&messages, "gw/ttn/downlink_count"), UNKNOWN);
        assert_eq!(payload(&messages, "gw/ttn/last_uplink_received_at"), "");
        assert_eq!(payload(&messages, "gw/ttn/last_downlink_received_at"), "");
        assert_eq!(payload(&messages, "gw/ttn/connected"), "0");
        assert_eq!(
            payload(&messages, "gw/ttn/last_update"),
            "2025-12-07T10:40:12.000Z"
        );
    }

    #[test]
    fn test_remote_group_with_data() {
        let layout = TopicLayout::new("gw");
        let status = RemoteStatus {
            uplink_count: Some(42),
            downlink_count: Some(0),
            last_uplink_at: Some(t0()),
            last_downlink_at: None,
            poll_error: true,
            last_poll_at: Some(t0()),
            last_success_at: Some(t0()),
        };
        let messages = layout.remote_group(&status, true, t0());
        assert_eq!(payload(&messages, "gw/ttn/uplink_count"), "42");
        assert_eq!(payload(&messages, "gw/ttn/downlink_count"), "0");
        assert_eq!(
            payload(&messages, "gw/ttn/last_uplink_received_at"),
            "2025-12-07T10:40:12.000Z"
        );
        assert_eq!(payload(&messages, "gw/ttn/connected"), "1");
    }

    #[test]
    fn test_status_topic() {
        assert_eq!(TopicLayout::new("gateways").status(), "gateways/status");
    }
}
