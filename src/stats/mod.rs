//! In-memory gateway statistics
//!
//! Two independent state objects, each with exactly one writer:
//! - [`CounterStore`], written by the log consumer
//! - [`RemoteStatusStore`], written by the TTN poller
//!
//! The publisher only ever reads copies via `snapshot()`. Locks are held for
//! the state transition only, never across I/O.

pub mod connectivity;

use crate::forwarder::parser::LogEvent;
use crate::ttn::types::ConnectionStats;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// Cumulative counts derived from the forwarder log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    pub rx_total: u64,
    pub tx_total: u64,
    pub last_rx_at: Option<DateTime<Utc>>,
}

impl CounterState {
    fn apply(&mut self, event: LogEvent, now: DateTime<Utc>) {
        match event {
            LogEvent::UplinkReceived => {
                self.rx_total = self.rx_total.saturating_add(1);
                // never move backwards, even if the wall clock does
                self.last_rx_at = Some(match self.last_rx_at {
                    Some(prev) if prev > now => prev,
                    _ => now,
                });
            }
            LogEvent::DownlinkSent => {
                self.tx_total = self.tx_total.saturating_add(1);
            }
            LogEvent::Unrecognized => {}
        }
    }
}

/// Shared handle to the process-wide [`CounterState`]
#[derive(Debug, Clone, Default)]
pub struct CounterStore {
    inner: Arc<Mutex<CounterState>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: LogEvent) {
        self.apply_at(event, Utc::now());
    }

    pub fn apply_at(&self, event: LogEvent, now: DateTime<Utc>) {
        if event == LogEvent::Unrecognized {
            return;
        }
        lock(&self.inner).apply(event, now);
    }

    pub fn snapshot(&self) -> CounterState {
        *lock(&self.inner)
    }
}

/// Last known gateway status as reported by the network server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub uplink_count: Option<u64>,
    pub downlink_count: Option<u64>,
    pub last_uplink_at: Option<DateTime<Utc>>,
    pub last_downlink_at: Option<DateTime<Utc>>,
    /// The most recent poll attempt failed
    pub poll_error: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Unset until the first successful poll
    pub last_success_at: Option<DateTime<Utc>>,
}

impl RemoteStatus {
    pub fn has_data(&self) -> bool {
        self.last_success_at.is_some()
    }

    /// The newer of the last uplink and last downlink timestamps
    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_uplink_at, self.last_downlink_at) {
            (Some(up), Some(down)) => Some(up.max(down)),
            (up, down) => up.or(down),
        }
    }
}

/// Shared handle to the process-wide [`RemoteStatus`]
#[derive(Debug, Clone, Default)]
pub struct RemoteStatusStore {
    inner: Arc<Mutex<RemoteStatus>>,
}

impl RemoteStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot wholesale and clear the error flag
    pub fn record_success(&self, stats: &ConnectionStats, at: DateTime<Utc>) {
        let next = RemoteStatus {
            uplink_count: Some(stats.uplink_count),
            downlink_count: Some(stats.downlink_count),
            last_uplink_at: stats.last_uplink_received_at,
            last_downlink_at: stats.last_downlink_received_at,
            poll_error: false,
            last_poll_at: Some(at),
            last_success_at: Some(at),
        };
        *lock(&self.inner) = next;
    }

    /// Flag the failure but keep whatever we knew before
    pub fn record_failure(&self, at: DateTime<Utc>) {
        let mut status = lock(&self.inner);
        status.poll_error = true;
        status.last_poll_at = Some(at);
    }

    pub fn snapshot(&self) -> RemoteStatus {
        *lock(&self.inner)
    }
}

// Every mutation above is a complete value transition, so a poisoned lock
// still guards a consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
