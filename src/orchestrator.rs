//! Owns the shared state and the three activities
//!
//! - log consumer: forwarder output -> [`CounterStore`]
//! - TTN poller: HTTP status -> [`RemoteStatusStore`] (only when enabled)
//! - publisher: both stores -> MQTT
//!
//! Each activity runs in its own supervised task. A panic or error in one
//! is logged and the activity restarted; the others keep running.

use crate::config::Config;
use crate::forwarder::{self, LogStreamSettings};
use crate::mqtt::{self, MqttPublisher, PublishSettings};
use crate::stats::{CounterStore, RemoteStatusStore};
use crate::ttn::{self, TtnClient};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Resolves once shutdown was requested (or the sender is gone).
/// Safe to use as a `select!` branch.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `task` in its own tokio task, restarting it after `delay` whenever it
/// returns or panics before shutdown.
pub fn supervise<F, Fut>(
    name: &'static str,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let result = tokio::spawn(task()).await;
            if *shutdown.borrow() {
                break;
            }
            match result {
                Ok(Ok(())) => warn!("{} exited unexpectedly, restarting in {:?}", name, delay),
                Ok(Err(e)) => error!("{} failed: {:#}. Restarting in {:?}", name, e, delay),
                Err(e) => error!("{} crashed: {}. Restarting in {:?}", name, e, delay),
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        debug!("{} supervisor finished", name);
    })
}

/// The gateway telemetry aggregator
pub struct Aggregator {
    config: Config,
    counters: CounterStore,
    remote: RemoteStatusStore,
}

impl Aggregator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            counters: CounterStore::new(),
            remote: RemoteStatusStore::new(),
        }
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn remote(&self) -> &RemoteStatusStore {
        &self.remote
    }

    /// Spawn every activity. All of them stop once `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        // Log consumption
        let settings = LogStreamSettings::from_config(&self.config.forwarder);
        let counters = self.counters.clone();
        let rx = shutdown.clone();
        handles.push(supervise("log consumer", RESTART_DELAY, shutdown.clone(), move || {
            forwarder::run_log_consumer(settings.clone(), counters.clone(), rx.clone())
        }));

        // Remote polling
        if self.config.ttn.enabled {
            let client = TtnClient::new(&self.config.ttn)?;
            let interval = Duration::from_secs(self.config.ttn.poll_interval_secs);
            let remote = self.remote.clone();
            let rx = shutdown.clone();
            handles.push(supervise("TTN poller", RESTART_DELAY, shutdown.clone(), move || {
                ttn::run_poller(client.clone(), remote.clone(), interval, rx.clone())
            }));
        } else {
            info!("TTN polling disabled; remote stats will be published as unknown");
        }

        // Publishing
        let (publisher, eventloop) = MqttPublisher::new(&self.config.mqtt);
        // The event loop is tied to this client instance and cannot be
        // rebuilt by a supervisor; it handles its own reconnects.
        handles.push(tokio::spawn({
            let publisher = publisher.clone();
            let rx = shutdown.clone();
            async move {
                if let Err(e) = mqtt::run_event_loop(eventloop, publisher, rx).await {
                    error!("MQTT event loop failed: {:#}", e);
                }
            }
        }));

        let publish_settings = PublishSettings {
            interval: Duration::from_secs(self.config.publish.interval_secs),
            local_stale_threshold: self.config.forwarder.stale_threshold(),
            remote_stale_threshold: self.config.ttn.stale_threshold(),
            remote_enabled: self.config.ttn.enabled,
        };
        let counters = self.counters.clone();
        let remote = self.remote.clone();
        let rx = shutdown.clone();
        handles.push(supervise("publisher", RESTART_DELAY, shutdown, move || {
            mqtt::run_publisher(
                publisher.clone(),
                counters.clone(),
                remote.clone(),
                publish_settings,
                rx.clone(),
            )
        }));

        Ok(handles)
    }
}

/// Wait for every task, giving up after `grace`
pub async fn join_all(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let joined = tokio::time::timeout(grace, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if joined.is_err() {
        warn!("Tasks still running after {:?}, aborting", grace);
        for abort in aborts {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_supervisor_restarts_crashed_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let runs = runs.clone();
            let rx_task = rx.clone();
            supervise("flaky", Duration::from_millis(5), rx, move || {
                let runs = runs.clone();
                let mut rx = rx_task.clone();
                async move {
                    match runs.fetch_add(1, Ordering::SeqCst) {
                        0 => panic!("first run blows up"),
                        1 => anyhow::bail!("second run fails"),
                        _ => {
                            wait_for_shutdown(&mut rx).await;
                            Ok(())
                        }
                    }
                }
            })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_aggregator_runs_without_broker_and_stops() {
        let mut config = Config::default();
        config.mqtt.host = "127.0.0.1".to_string();
        config.mqtt.port = 1;
        config.publish.interval_secs = 1;
        config.forwarder.command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo '[S2E:VERB] RX 868.1MHz'; echo '[S2E:VERB] TX ::0'; exec sleep 60".to_string(),
        ]);

        let aggregator = Aggregator::new(config);
        let (tx, rx) = watch::channel(false);
        let handles = aggregator.start(rx).unwrap();
        assert_eq!(handles.len(), 3);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while aggregator.counters().snapshot().tx_total < 1
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = aggregator.counters().snapshot();
        assert_eq!(snap.rx_total, 1);
        assert_eq!(snap.tx_total, 1);
        assert!(!aggregator.remote().snapshot().has_data());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), join_all(handles, Duration::from_secs(3)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enabled_ttn_adds_poller() {
        let mut config = Config::default();
        config.mqtt.port = 1;
        config.forwarder.command = Some(vec!["true".to_string()]);
        config.ttn.enabled = true;
        config.ttn.gateway_id = "gw".to_string();
        config.ttn.api_key = "key".to_string();
        config.ttn.base_url = Some("http://127.0.0.1:1".to_string());

        let aggregator = Aggregator::new(config);
        let (tx, rx) = watch::channel(false);
        let handles = aggregator.start(rx).unwrap();
        assert_eq!(handles.len(), 4);

        tx.send(true).unwrap();
        join_all(handles, Duration::from_secs(3)).await;
    }
}
