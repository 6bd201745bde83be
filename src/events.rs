// =============================================================================
// Engine Events: typed bus from the decision core to the outside world
// =============================================================================
//
// The core publishes `EngineEvent`s on an unbounded channel and never waits
// on a consumer. The dispatcher fans every event out to one worker per sink;
// each worker delivers in order and retries with exponential backoff, so a
// slow or failing sink delays only itself.
//
// Shutdown: `EventBus::close` drops the sender, the dispatcher drains what is
// queued, closes the worker channels and waits for every worker to finish.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::entry_gate::Signal;
use crate::position_engine::PositionClosed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Signal(Signal),
    PositionClosed(PositionClosed),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::PositionClosed(_) => "position_closed",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Signal(s) => &s.symbol,
            Self::PositionClosed(c) => &c.symbol,
        }
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Publishing handle shared by all symbol workers.
#[derive(Debug)]
pub struct EventBus {
    tx: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Queue an event. Returns false once the bus is closed.
    pub fn publish(&self, event: EngineEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                warn!(kind = event.kind(), symbol = event.symbol(), "event dropped: bus closed");
                false
            }
        }
    }

    /// Stop accepting events. Already queued events are still delivered.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            info!("event bus closed");
        }
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// A consumer of engine events (notifier, history store, ...).
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver<'a>(&'a self, event: &'a EngineEvent) -> BoxFuture<'a, Result<()>>;
}

/// Structured log line per event.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver<'a>(&'a self, event: &'a EngineEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match event {
                EngineEvent::Signal(s) => info!(
                    target: "sgnl::events",
                    id = %s.id,
                    symbol = %s.symbol,
                    exchange = %s.exchange,
                    entry = s.entry_price,
                    tp = s.take_profit_price,
                    sl = s.stop_loss_price,
                    score = s.score,
                    reasons = ?s.reasons,
                    "SHORT signal"
                ),
                EngineEvent::PositionClosed(c) => info!(
                    target: "sgnl::events",
                    position_id = %c.position_id,
                    symbol = %c.symbol,
                    exchange = %c.exchange,
                    reason = %c.exit_reason,
                    detail = ?c.exit_detail,
                    entry = c.entry_price,
                    exit = c.exit_price,
                    pnl_pct = c.realized_pnl_pct,
                    peak_pct = c.peak_profit_pct,
                    duration_secs = c.duration_secs,
                    "position closed"
                ),
            }
            Ok(())
        })
    }
}

/// Appends one JSON object per line to a history file.
#[derive(Debug)]
pub struct JsonlHistorySink {
    path: PathBuf,
}

impl JsonlHistorySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, event: &EngineEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("failed to serialise event")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open history file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

impl EventSink for JsonlHistorySink {
    fn name(&self) -> &str {
        "history"
    }

    fn deliver<'a>(&'a self, event: &'a EngineEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.append(event))
    }
}

/// POSTs each event as JSON to a webhook.
#[derive(Debug)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, event: &EngineEvent) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("webhook request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("webhook returned {status}: {body}");
        }
        Ok(())
    }
}

impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn deliver<'a>(&'a self, event: &'a EngineEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post(event))
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the wait after the
    /// first failure is `backoff(1)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Forward every event from `rx` to every sink until the bus is closed and
/// drained, then wait for all sink workers to finish.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    retry: RetryPolicy,
) {
    info!(
        sinks = ?sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
        "event dispatcher started"
    );

    let mut workers = JoinSet::new();
    let mut lanes = Vec::with_capacity(sinks.len());

    for sink in sinks {
        let (tx, lane_rx) = mpsc::unbounded_channel::<Arc<EngineEvent>>();
        lanes.push(tx);
        workers.spawn(sink_worker(sink, lane_rx, retry));
    }

    while let Some(event) = rx.recv().await {
        let event = Arc::new(event);
        for lane in &lanes {
            let _ = lane.send(Arc::clone(&event));
        }
    }

    drop(lanes);
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "sink worker panicked");
        }
    }
    info!("event dispatcher drained");
}

async fn sink_worker(
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<Arc<EngineEvent>>,
    retry: RetryPolicy,
) {
    while let Some(event) = rx.recv().await {
        let mut attempt = 1;
        loop {
            match sink.deliver(&event).await {
                Ok(()) => {
                    debug!(sink = sink.name(), kind = event.kind(), attempt, "event delivered");
                    break;
                }
                Err(e) if attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        sink = sink.name(),
                        kind = event.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "event delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        sink = sink.name(),
                        kind = event.kind(),
                        symbol = event.symbol(),
                        attempts = attempt,
                        error = %e,
                        "event dropped after retries"
                    );
                    break;
                }
            }
        }
    }
}
