//! MQTT publisher
//!
//! Every publish cycle composes the local and TTN groups from fresh
//! snapshots and enqueues them without waiting for the broker
//! (`try_publish`, QoS 0). A broker outage only costs log lines; the next
//! cycle publishes the then-current values again.

pub mod topics;

use crate::config::MqttConfig;
use crate::orchestrator::wait_for_shutdown;
use crate::stats::connectivity::ConnectivitySnapshot;
use crate::stats::{CounterStore, RemoteStatus, RemoteStatusStore};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use topics::{Message, TopicLayout, OFFLINE, ONLINE};
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 64;
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing and feature switches for the publish cycle
#[derive(Debug, Clone, Copy)]
pub struct PublishSettings {
    pub interval: Duration,
    pub local_stale_threshold: Duration,
    pub remote_stale_threshold: Duration,
    pub remote_enabled: bool,
}

/// Handle used to enqueue publishes. Cheap to clone.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    layout: TopicLayout,
    retain: bool,
}

impl MqttPublisher {
    /// Build the client and its event loop. Nothing touches the network
    /// until the event loop is polled (see [`run_event_loop`]).
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let layout = TopicLayout::new(&config.topic_prefix);
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", config.client_id, &suffix[..8]);

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_last_will(LastWill::new(
            layout.status(),
            OFFLINE,
            QoS::AtMostOnce,
            config.retain,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (
            Self {
                client,
                layout,
                retain: config.retain,
            },
            eventloop,
        )
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    /// Enqueue messages without blocking. Returns how many were rejected.
    pub fn publish_all(&self, messages: &[Message]) -> usize {
        let mut failed = 0;
        for message in messages {
            if let Err(e) = self.client.try_publish(
                message.topic.clone(),
                QoS::AtMostOnce,
                self.retain,
                message.payload.clone(),
            ) {
                failed += 1;
                debug!("Failed to enqueue {}: {}", message.topic, e);
            }
        }
        failed
    }

    fn announce(&self, payload: &str) {
        let status = Message {
            topic: self.layout.status(),
            payload: payload.to_string(),
        };
        self.publish_all(std::slice::from_ref(&status));
    }

    /// Publish `offline` and ask the event loop to disconnect
    pub fn shutdown(&self) {
        self.announce(OFFLINE);
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {}", e);
        }
    }
}

/// Everything one publish cycle emits, computed from one snapshot of each store
pub fn compose_cycle(
    layout: &TopicLayout,
    counters: &CounterStore,
    remote: &RemoteStatusStore,
    settings: &PublishSettings,
    now: DateTime<Utc>,
) -> Vec<Message> {
    let local = counters.snapshot();
    let remote = if settings.remote_enabled {
        remote.snapshot()
    } else {
        RemoteStatus::default()
    };
    let connectivity = ConnectivitySnapshot::compute(
        &local,
        &remote,
        now,
        settings.local_stale_threshold,
        settings.remote_stale_threshold,
    );

    let mut messages = layout.local_group(&local, connectivity.local_connected, now);
    messages.extend(layout.remote_group(&remote, connectivity.remote_connected, now));
    messages
}

/// Publish the full state every `settings.interval` until shutdown
pub async fn run_publisher(
    publisher: MqttPublisher,
    counters: CounterStore,
    remote: RemoteStatusStore,
    settings: PublishSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "Publishing gateway stats under {}/... every {:?}",
        publisher.layout().prefix(),
        settings.interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        let now = Utc::now();
        let messages = compose_cycle(publisher.layout(), &counters, &remote, &settings, now);
        let failed = publisher.publish_all(&messages);
        if failed > 0 {
            warn!(
                "Publish cycle: {} of {} messages not queued (broker unavailable?)",
                failed,
                messages.len()
            );
        } else {
            debug!("Publish cycle: {} messages queued", messages.len());
        }
    }

    publisher.shutdown();
    info!("Publisher stopped");
    Ok(())
}

/// Drive the MQTT connection: reconnect with backoff, announce `online` on
/// every (re)connect. After shutdown, keep polling briefly so the final
/// `offline` and DISCONNECT reach the broker.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    publisher: MqttPublisher,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut backoff = Duration::from_secs(1);

    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                backoff = Duration::from_secs(1);
                publisher.announce(ONLINE);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Retrying in {:?}...", e, backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
            }
        }
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("MQTT drain timed out");
    }
    info!("MQTT connection closed");
    Ok(())
}
