//! Classification of packet-forwarder log lines
//!
//! The forwarder's output format is not a contract. We only look for a few
//! textual markers that signal an uplink was received or a downlink was sent,
//! e.g. LoRa Basic Station:
//!
//! ```text
//! 2025-12-07 10:40:12.345 [S2E:VERB] RX 868.1MHz DR5 SF7/BW125 snr=9.5 rssi=-42 ...
//! 2025-12-07 10:40:13.101 [S2E:VERB] TX ::0 diid=12 [ant#0] - dnmsg: 868.1MHz ...
//! ```
//!
//! Anything else is `Unrecognized` and dropped.

use crate::config::ForwarderConfig;
use std::fmt;

/// What a single log line tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    UplinkReceived,
    DownlinkSent,
    Unrecognized,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::UplinkReceived => write!(f, "RX"),
            LogEvent::DownlinkSent => write!(f, "TX"),
            LogEvent::Unrecognized => write!(f, "-"),
        }
    }
}

/// A marker matches when every one of its parts occurs in the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    parts: Vec<String>,
}

impl Marker {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|part| line.contains(part.as_str()))
    }
}

/// Turns raw lines into [`LogEvent`]s. Uplink markers take precedence.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    uplink: Vec<Marker>,
    downlink: Vec<Marker>,
}

impl LineClassifier {
    pub fn new(uplink: Vec<Marker>, downlink: Vec<Marker>) -> Self {
        Self { uplink, downlink }
    }

    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self::new(
            config.uplink_markers.iter().map(Marker::new).collect(),
            config.downlink_markers.iter().map(Marker::new).collect(),
        )
    }

    pub fn classify(&self, line: &str) -> LogEvent {
        if line.trim().is_empty() {
            return LogEvent::Unrecognized;
        }
        if self.uplink.iter().any(|m| m.matches(line)) {
            LogEvent::UplinkReceived
        } else if self.downlink.iter().any(|m| m.matches(line)) {
            LogEvent::DownlinkSent
        } else {
            LogEvent::Unrecognized
        }
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::from_config(&ForwarderConfig::default())
    }
}
