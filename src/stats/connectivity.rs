//! "Connected" heuristics
//!
//! Pure functions of (snapshot, now, threshold). Nothing is remembered
//! between evaluations.

use super::{CounterState, RemoteStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Both heuristics evaluated at the same instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub local_connected: bool,
    pub remote_connected: bool,
    pub computed_at: DateTime<Utc>,
}

impl ConnectivitySnapshot {
    pub fn compute(
        local: &CounterState,
        remote: &RemoteStatus,
        now: DateTime<Utc>,
        local_threshold: Duration,
        remote_threshold: Duration,
    ) -> Self {
        Self {
            local_connected: local_connected(local, now, local_threshold),
            remote_connected: remote_connected(remote, now, remote_threshold),
            computed_at: now,
        }
    }
}

/// Connected while the last RX is younger than `threshold`.
pub fn local_connected(state: &CounterState, now: DateTime<Utc>, threshold: Duration) -> bool {
    state
        .last_rx_at
        .is_some_and(|at| is_fresh(at, now, threshold))
}

/// Connected while the newest remote last-seen timestamp is younger than
/// `threshold`. A failed poll does not force `false`; the last known
/// timestamps keep being aged until a poll replaces them.
pub fn remote_connected(status: &RemoteStatus, now: DateTime<Utc>, threshold: Duration) -> bool {
    if !status.has_data() {
        return false;
    }
    status
        .last_seen_at()
        .is_some_and(|at| is_fresh(at, now, threshold))
}

// Timestamps from the future (clock skew) count as age zero.
fn is_fresh(at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let age = now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO);
    age < threshold
}
