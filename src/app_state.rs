// =============================================================================
// Central Application State: SGNL decision engine
// =============================================================================
//
// Ties the decision components together and provides a unified snapshot for
// the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the shared ring buffers and score map.
//   - Components (ledger, position book, feature cache) own their locks.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::decision_envelope::GateDecision;
use crate::entry_gate::{EntryGate, GateStats, GateStatsSnapshot, Signal};
use crate::events::{EngineEvent, EventBus};
use crate::exit::ExitEvaluator;
use crate::feature_source::{FeatureCache, FeatureSource};
use crate::position_engine::{JournalStats, Position, PositionBook};
use crate::runtime_config::EngineConfig;
use crate::signals::{LedgerSnapshot, Score, Scorer, SignalLedger};
use crate::types::SymbolKey;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub at: DateTime<Utc>,
}

const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_DECISIONS: usize = 200;
const MAX_RECENT_SIGNALS: usize = 100;

/// Shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every meaningful mutation; the WebSocket feed pushes
    /// when it changes.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: EngineConfig,
    pub symbols: Vec<SymbolKey>,

    // ── Decision components ─────────────────────────────────────────────
    pub features: Arc<FeatureCache>,
    pub scorer: Scorer,
    pub entry_gate: EntryGate,
    pub exit_evaluator: ExitEvaluator,
    pub ledger: SignalLedger,
    pub positions: PositionBook,
    pub gate_stats: GateStats,

    pub events: EventBus,

    // ── Dashboard state ─────────────────────────────────────────────────
    pub last_scores: RwLock<HashMap<SymbolKey, Score>>,
    pub recent_signals: RwLock<VecDeque<Signal>>,
    pub recent_decisions: RwLock<VecDeque<GateDecision>>,
    pub recent_errors: RwLock<VecDeque<ErrorRecord>>,
    pub ticks_completed: AtomicU64,
    pub last_tick_at: RwLock<Option<DateTime<Utc>>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the state from a validated config. `now` seeds the ledger's
    /// current UTC date.
    pub fn new(config: EngineConfig, events: EventBus, now: DateTime<Utc>) -> Self {
        let ledger = SignalLedger::new(
            config.cooldown(),
            config.dedup_window(),
            config.max_daily_signals,
            now,
        );

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            symbols: config.symbol_keys(),
            features: Arc::new(FeatureCache::new(config.tick_interval())),
            scorer: Scorer::default(),
            entry_gate: EntryGate::new(&config),
            exit_evaluator: ExitEvaluator::new(&config),
            ledger,
            positions: PositionBook::new(config.trail_activate_pct),
            gate_stats: GateStats::default(),
            config,

            events,

            last_scores: RwLock::new(HashMap::new()),
            recent_signals: RwLock::new(VecDeque::new()),
            recent_decisions: RwLock::new(VecDeque::new()),
            recent_errors: RwLock::new(VecDeque::new()),
            ticks_completed: AtomicU64::new(0),
            last_tick_at: RwLock::new(None),

            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Ring buffers ────────────────────────────────────────────────────

    pub fn push_error(&self, message: String, symbol: Option<&SymbolKey>) {
        let mut errors = self.recent_errors.write();
        errors.push_back(ErrorRecord {
            message,
            symbol: symbol.map(|k| k.to_string()),
            at: Utc::now(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        drop(errors);
        self.increment_version();
    }

    pub fn push_decision(&self, decision: GateDecision) {
        let mut decisions = self.recent_decisions.write();
        decisions.push_back(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.pop_front();
        }
    }

    pub fn record_score(&self, key: &SymbolKey, score: Score) {
        self.last_scores.write().insert(key.clone(), score);
    }

    /// Keep the signal for the dashboard and hand it to the event bus.
    pub fn publish_signal(&self, signal: Signal) {
        self.remember_signal(signal.clone());
        self.events.publish(EngineEvent::Signal(signal));
        self.increment_version();
    }

    /// Add to the recent-signal ring without publishing.
    pub fn remember_signal(&self, signal: Signal) {
        let mut signals = self.recent_signals.write();
        signals.push_back(signal);
        while signals.len() > MAX_RECENT_SIGNALS {
            signals.pop_front();
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Scores sorted from strongest to weakest.
    pub fn ranked_scores(&self) -> Vec<Score> {
        let mut scores: Vec<Score> = self.last_scores.read().values().cloned().collect();
        scores.sort_by(|a, b| b.value.total_cmp(&a.value));
        scores
    }

    pub fn recent_signals(&self, count: usize) -> Vec<Signal> {
        self.recent_signals.read().iter().rev().take(count).cloned().collect()
    }

    pub fn recent_decisions(&self, count: usize) -> Vec<GateDecision> {
        self.recent_decisions.read().iter().rev().take(count).cloned().collect()
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Serialisable snapshot served by `GET /api/v1/state` and the
    /// WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let scores = self.last_scores.read();

        let symbols = self
            .symbols
            .iter()
            .map(|key| {
                let position = self.positions.get_open(key);
                let feature_age_secs = self
                    .features
                    .latest(key)
                    .map(|f| now.signed_duration_since(f.timestamp).num_seconds());
                SymbolView {
                    symbol: key.symbol.clone(),
                    exchange: key.exchange.clone(),
                    status: if position.is_some() {
                        SymbolStatus::Open
                    } else {
                        SymbolStatus::Flat
                    },
                    last_score: scores.get(key).map(|s| s.value),
                    reasons: scores.get(key).map(|s| s.reasons.clone()).unwrap_or_default(),
                    feature_age_secs,
                    position,
                }
            })
            .collect();
        drop(scores);

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            last_tick_at: *self.last_tick_at.read(),
            symbols,
            ledger: self.ledger.snapshot(now),
            gate_stats: self.gate_stats.snapshot(),
            recent_signals: self.recent_signals(20),
            recent_decisions: self.recent_decisions(20),
            recent_errors: self.recent_errors.read().iter().cloned().collect(),
            journal_stats: self.positions.journal_stats(),
            config: ConfigSummary::from(&self.config),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("symbols", &self.symbols)
            .field("positions", &self.positions)
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub ticks_completed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub symbols: Vec<SymbolView>,
    pub ledger: LedgerSnapshot,
    pub gate_stats: GateStatsSnapshot,
    pub recent_signals: Vec<Signal>,
    pub recent_decisions: Vec<GateDecision>,
    pub recent_errors: Vec<ErrorRecord>,
    pub journal_stats: JournalStats,
    pub config: ConfigSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolStatus {
    Flat,
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolView {
    pub symbol: String,
    pub exchange: String,
    pub status: SymbolStatus,
    pub last_score: Option<f64>,
    pub reasons: Vec<String>,
    /// Age of the newest feature snapshot, if any has arrived.
    pub feature_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub score_min: f64,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub hard_stop_loss_pct: f64,
    pub trail_activate_pct: f64,
    pub trail_giveback_pct: f64,
    pub cooldown_seconds: u64,
    pub max_daily_signals: u32,
    pub tick_interval_seconds: u64,
}

impl From<&EngineConfig> for ConfigSummary {
    fn from(c: &EngineConfig) -> Self {
        Self {
            score_min: c.score_min,
            tp_pct: c.tp_pct,
            sl_pct: c.effective_sl_pct(),
            hard_stop_loss_pct: c.hard_stop_loss_pct,
            trail_activate_pct: c.trail_activate_pct,
            trail_giveback_pct: c.trail_giveback_pct,
            cooldown_seconds: c.cooldown_seconds,
            max_daily_signals: c.max_daily_signals,
            tick_interval_seconds: c.tick_interval_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureSnapshot;

    fn state() -> AppState {
        let (bus, _rx) = EventBus::new();
        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["AAAUSDT@binance".into(), "BBBUSDT@bybit".into()];
        AppState::new(cfg, bus, Utc::now())
    }

    #[test]
    fn snapshot_lists_every_configured_symbol_flat() {
        let s = state();
        let snap = s.build_snapshot();
        assert_eq!(snap.symbols.len(), 2);
        assert!(snap.symbols.iter().all(|v| v.status == SymbolStatus::Flat));
        assert_eq!(snap.ledger.remaining_today, 8);
        assert!(snap.symbols.iter().all(|v| v.feature_age_secs.is_none()));
    }

    #[test]
    fn ranked_scores_strongest_first() {
        let s = state();
        for (sym, oi) in [("AAAUSDT", 0.2), ("BBBUSDT", 0.9)] {
            let key = SymbolKey::new(sym, "binance");
            let mut f = FeatureSnapshot::empty(&key, Utc::now());
            f.oi_divergence = Some(oi);
            s.record_score(&key, s.scorer.score(&f));
        }
        let ranked = s.ranked_scores();
        assert_eq!(ranked[0].symbol, "BBBUSDT");
        assert!(ranked[0].value > ranked[1].value);
    }

    #[test]
    fn error_ring_buffer_is_bounded() {
        let s = state();
        let before = s.current_state_version();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            s.push_error(format!("e{i}"), None);
        }
        let errors = s.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.front().unwrap().message, "e5");
        assert!(s.current_state_version() > before);
    }
}
