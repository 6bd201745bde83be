// =============================================================================
// SGNL Engine: Main Entry Point
// =============================================================================
//
// Startup order: env + logging, config (file, env overrides, validation),
// shared state, history replay, event dispatcher, API server, tick loop. Ctrl-C stops the
// tick loop after its in-flight tick, closes the event bus and waits for the
// dispatcher to drain every queued event.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod decision_envelope;
mod engine;
mod entry_gate;
mod events;
mod exit;
mod feature_source;
mod position_engine;
mod recovery;
mod runtime_config;
mod signals;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::events::{EventBus, EventSink, JsonlHistorySink, LogSink, RetryPolicy, WebhookSink};
use crate::runtime_config::EngineConfig;

const DEFAULT_CONFIG_PATH: &str = "sgnl_config.json";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("SGNL engine starting up");

    // ── 2. Config ────────────────────────────────────────────────────────
    let config_path =
        std::env::var("SGNL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = if Path::new(&config_path).exists() {
        EngineConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        EngineConfig::default()
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config
        .validate()
        .context("engine config failed validation")?;

    info!(
        symbols = ?config.symbols,
        score_min = config.score_min,
        tick_interval_secs = config.tick_interval_seconds,
        max_daily_signals = config.max_daily_signals,
        "engine config ready"
    );

    if std::env::var(api::auth::ADMIN_TOKEN_ENV)
        .unwrap_or_default()
        .is_empty()
    {
        warn!(
            "{} is not set; authenticated API endpoints will reject every request",
            api::auth::ADMIN_TOKEN_ENV
        );
    }

    // ── 3. Shared state & event bus ──────────────────────────────────────
    let (bus, event_rx) = EventBus::new();
    let state = Arc::new(AppState::new(config, bus, chrono::Utc::now()));

    let history_path = std::env::var("SGNL_HISTORY_PATH").ok().map(PathBuf::from);
    if let Some(path) = &history_path {
        let now = chrono::Utc::now();
        recovery::recover_from_history(path, &state, now)
            .await
            .context("failed to recover state from history")?;
        info!(
            open_positions = state.positions.open_positions().len(),
            remaining_today = state.ledger.remaining_today(now),
            "engine state restored"
        );
    }

    // ── 4. Event sinks & dispatcher ──────────────────────────────────────
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];

    if let Some(path) = history_path {
        info!(path = %path.display(), "history sink enabled");
        sinks.push(Arc::new(JsonlHistorySink::new(path)));
    }
    if let Ok(url) = std::env::var("SGNL_WEBHOOK_URL") {
        sinks.push(Arc::new(WebhookSink::new(url)?));
        info!("webhook sink enabled");
    }

    let dispatcher = tokio::spawn(events::run_dispatcher(
        event_rx,
        sinks,
        RetryPolicy::default(),
    ));

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("SGNL_BIND").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 6. Tick loop ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tick_loop = tokio::spawn(engine::run_tick_loop(state.clone(), shutdown_rx));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    if let Err(e) = tick_loop.await {
        error!(error = %e, "tick loop task failed");
    }

    state.events.close();
    match tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, dispatcher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "event dispatcher task failed"),
        Err(_) => warn!(
            timeout_secs = DISPATCHER_DRAIN_TIMEOUT.as_secs(),
            "event dispatcher did not drain in time, exiting anyway"
        ),
    }

    let ledger = state.ledger.snapshot(chrono::Utc::now());
    info!(
        signals_today = ledger.signals_today,
        ticks = state.ticks_completed.load(std::sync::atomic::Ordering::Relaxed),
        "SGNL engine shut down complete"
    );
    Ok(())
}
