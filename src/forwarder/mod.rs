//! Packet-forwarder log stream
//!
//! The forwarder runs independently of us (usually as the `basicstation`
//! container). We follow its output through a child process, by default
//! `docker logs --follow --tail 0 <container>`, and classify each line.
//!
//! The stream is restartable: when the child exits (container restarted,
//! Docker daemon bounced, ...) we reattach after a bounded backoff.
//! `--tail 0` keeps a reattach from counting old lines twice.

pub mod parser;

use crate::config::ForwarderConfig;
use crate::orchestrator::wait_for_shutdown;
use crate::stats::CounterStore;
use parser::{LineClassifier, LogEvent};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const LINE_BUFFER: usize = 1024;
/// Longest line we keep; the rest up to the next newline is discarded
pub const MAX_LINE_BYTES: usize = 64 * 1024;
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// How to attach to the forwarder and how to recognize its events
#[derive(Debug, Clone)]
pub struct LogStreamSettings {
    pub command: Vec<String>,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub classifier: LineClassifier,
}

impl LogStreamSettings {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self {
            command: config.log_command(),
            backoff: Duration::from_secs(config.reconnect_backoff_secs.max(1)),
            max_backoff: Duration::from_secs(
                config.max_backoff_secs.max(config.reconnect_backoff_secs.max(1)),
            ),
            classifier: LineClassifier::from_config(config),
        }
    }
}

/// One attachment to the forwarder's output. Yields lines until both
/// stdout and stderr are closed, then `None`. Dropping it kills the child.
pub struct LogStream {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl LogStream {
    pub fn spawn(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty log command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start {:?}: {}", program, e))?;

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(BufReader::new(stdout), tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(BufReader::new(stderr), tx));
        }

        Ok(Self { child, lines })
    }

    /// Next line, or `None` once the stream has ended
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Reap the child after the stream ended
    async fn finish(mut self) -> Option<ExitStatus> {
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                let _ = self.child.kill().await;
                None
            }
        }
    }
}

/// Forward every line of `reader` into `tx`. Invalid UTF-8 is replaced
/// rather than treated as an error; lines longer than [`MAX_LINE_BYTES`]
/// are cut off.
pub async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let consumed = read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await?;
        if consumed == 0 {
            return Ok(());
        }
        if consumed > buf.len() {
            debug!("Dropped {} bytes of an overlong log line", consumed - buf.len());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        if line.is_empty() {
            continue;
        }
        if tx.send(line.to_string()).await.is_err() {
            // consumer went away
            return Ok(());
        }
    }
}

/// Read up to and including the next `\n`, keeping at most `max` bytes in
/// `buf`. Returns how many bytes were consumed from `reader` (0 at EOF).
async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(idx) => (&available[..=idx], true),
            None => (available, false),
        };
        let keep = chunk.len().min(max.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        let n = chunk.len();
        reader.consume(n);
        consumed += n;
        if done {
            return Ok(consumed);
        }
    }
}

/// Classify one line and fold it into the counters
pub fn apply_line(classifier: &LineClassifier, store: &CounterStore, line: &str) -> LogEvent {
    let event = classifier.classify(line);
    if event != LogEvent::Unrecognized {
        debug!("Found {}: {}", event, truncate(line, 120));
        store.apply(event);
    }
    event
}

/// Follow the forwarder's log output until shutdown, reattaching whenever
/// the stream ends.
pub async fn run_log_consumer(
    settings: LogStreamSettings,
    store: CounterStore,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut backoff = settings.backoff;
    let command_line = settings.command.join(" ");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match LogStream::spawn(&settings.command) {
            Ok(mut stream) => {
                info!("Attached to forwarder log stream: {}", command_line);
                let mut seen = 0u64;
                loop {
                    tokio::select! {
                        line = stream.next_line() => match line {
                            Some(line) => {
                                apply_line(&settings.classifier, &store, &line);
                                seen += 1;
                            }
                            None => break,
                        },
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!("Log consumer stopped");
                            return Ok(());
                        }
                    }
                }

                let status = stream.finish().await;
                let snap = store.snapshot();
                warn!(
                    "Forwarder log stream ended after {} lines (exit: {:?}); RX={}, TX={}",
                    seen, status, snap.rx_total, snap.tx_total
                );
                if seen > 0 {
                    backoff = settings.backoff;
                }
            }
            Err(e) => warn!("Cannot attach to forwarder logs: {}", e),
        }

        debug!("Reattaching to forwarder logs in {:?}", backoff);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
        backoff = (backoff * 2).min(settings.max_backoff);
    }

    info!("Log consumer stopped");
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
