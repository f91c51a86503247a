//! The Things Stack gateway status poller
//!
//! Polls the Gateway Server for the gateway's connection stats on a fixed
//! interval, independent of the local log path:
//!
//! `GET {base}/api/v3/gs/gateways/{gateway_id}/connection/stats`
//! with `Authorization: Bearer <api key>`.
//!
//! A failed poll only flags `poll_error`; the previous snapshot stays.
//!
//! Reference: <https://www.thethingsindustries.com/docs/api/reference/http/>

pub mod types;

use crate::config::TtnConfig;
use crate::orchestrator::wait_for_shutdown;
use crate::stats::RemoteStatusStore;
use anyhow::Context;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use types::ConnectionStats;

/// Why a poll produced no information
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// HTTP client for one gateway's connection stats
#[derive(Clone)]
pub struct TtnClient {
    http: Client,
    url: String,
    api_key: String,
    gateway_id: String,
}

impl TtnClient {
    pub fn new(config: &TtnConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("gateway-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let url = format!(
            "{}/api/v3/gs/gateways/{}/connection/stats",
            config.base_url(),
            config.gateway_id
        );

        info!(
            "TTN client created for gateway {} at {}",
            config.gateway_id,
            config.base_url()
        );

        Ok(Self {
            http,
            url,
            api_key: config.api_key.clone(),
            gateway_id: config.gateway_id.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request/response round trip
    pub async fn fetch_stats(&self) -> Result<ConnectionStats, PollError> {
        let resp = self
            .http
            .get(&self.url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(PollError::Status {
                status,
                body: truncate(&body, 200),
            });
        }

        debug!("TTN stats raw for {}: {}", self.gateway_id, body);
        Ok(serde_json::from_str(&body)?)
    }

    /// Poll once and fold the outcome into `store`
    pub async fn poll(&self, store: &RemoteStatusStore) -> bool {
        match self.fetch_stats().await {
            Ok(stats) => {
                store.record_success(&stats, Utc::now());
                info!(
                    "TTN: up={}, down={}, last_up={:?}",
                    stats.uplink_count, stats.downlink_count, stats.last_uplink_received_at
                );
                true
            }
            Err(e) => {
                store.record_failure(Utc::now());
                warn!("Error fetching TTN stats for {}: {}", self.gateway_id, e);
                false
            }
        }
    }
}

/// Poll on a fixed interval until shutdown. Requests never overlap: the
/// next tick is only awaited after the previous request finished.
pub async fn run_poller(
    client: TtnClient,
    store: RemoteStatusStore,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Polling {} every {:?}", client.url(), interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        tokio::select! {
            _ = client.poll(&store) => {}
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Aborting in-flight TTN request");
                break;
            }
        }
    }

    info!("TTN poller stopped");
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
