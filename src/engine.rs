// =============================================================================
// Decision Engine: per-symbol tick pipeline and the tick driver
// =============================================================================
//
// Per symbol, per tick:
//   1. Latest FeatureSnapshot (skip if none, or older than 2 ticks)
//   2. Open position?  update with the price, then run the exit rules;
//      close and publish PositionClosed on a hit
//   3. Score the snapshot
//   4. Entry gate (conditions, then ledger admission)
//   5. On Emit: open the position and publish the Signal
//
// The driver fans one task per symbol out on a JoinSet and joins them all
// before the next tick, so a symbol is never evaluated twice concurrently.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::decision_envelope::{DecisionOutcome, GateDecision};
use crate::entry_gate::Verdict;
use crate::events::EngineEvent;
use crate::exit::{ExitReason, MarketContext};
use crate::feature_source::FeatureSource;
use crate::types::SymbolKey;

/// What happened to one symbol in one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// No snapshot has arrived for the symbol yet.
    NoData,
    /// The newest snapshot is too old to act on.
    Stale { age_secs: i64 },
    Evaluated {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitReason>,
        decision: DecisionOutcome,
    },
}

/// Run the full pipeline for one symbol at `now`.
pub fn process_symbol(state: &AppState, key: &SymbolKey, now: DateTime<Utc>) -> TickOutcome {
    let Some(snapshot) = state.features.latest(key) else {
        debug!(symbol = %key, "no feature snapshot yet");
        return TickOutcome::NoData;
    };

    if snapshot.is_stale(now, state.config.staleness_limit()) {
        let age_secs = now.signed_duration_since(snapshot.timestamp).num_seconds();
        debug!(symbol = %key, age_secs, "stale feature snapshot, skipping");
        return TickOutcome::Stale { age_secs };
    }

    let (clean, degraded) = snapshot.sanitized();
    if !degraded.is_empty() {
        warn!(symbol = %key, fields = ?degraded, "invalid feature values neutralized");
    }

    // ── Exits ───────────────────────────────────────────────────────────
    let mut exit = None;
    if let Some(current) = state.positions.get_open(key) {
        let updated = match clean.price {
            Some(price) => state.positions.update(key, price),
            None => Some(current),
        };

        if let Some(pos) = updated {
            let price = pos.last_price;
            let ctx = MarketContext::from_snapshot(&clean);
            if let Some(decision) = state.exit_evaluator.evaluate(&pos, price, &ctx, now) {
                if let Some(closed) = state.positions.close(key, &decision, now) {
                    exit = Some(closed.exit_reason);
                    state.events.publish(EngineEvent::PositionClosed(closed));
                }
            }
            state.increment_version();
        }
    }

    // ── Score + gate ────────────────────────────────────────────────────
    let score = state.scorer.score(&snapshot);
    let has_open = state.positions.has_open(key);
    let verdict = state
        .entry_gate
        .evaluate(&score, &snapshot, has_open, &state.ledger, now);

    state.gate_stats.record(&verdict);
    let decision = GateDecision::from_verdict(&verdict, &score, now);
    let outcome = decision.outcome;
    state.push_decision(decision);
    state.record_score(key, score);

    if let Verdict::Emit(signal) = verdict {
        if let Err(e) = state.positions.open(&signal, now) {
            warn!(symbol = %key, signal_id = %signal.id, error = %e, "position not opened for signal");
            state.push_error(format!("open failed: {e}"), Some(key));
        }
        state.publish_signal(signal);
    }

    TickOutcome::Evaluated {
        exit,
        decision: outcome,
    }
}

/// Evaluate every configured symbol once, concurrently, and wait for all.
pub async fn run_tick(state: &Arc<AppState>, now: DateTime<Utc>) -> Vec<(SymbolKey, TickOutcome)> {
    let mut set = JoinSet::new();
    for key in state.symbols.iter().cloned() {
        let st = Arc::clone(state);
        set.spawn(async move {
            let outcome = process_symbol(&st, &key, now);
            (key, outcome)
        });
    }

    let mut outcomes = Vec::with_capacity(state.symbols.len());
    while let Some(res) = set.join_next().await {
        match res {
            Ok(pair) => outcomes.push(pair),
            Err(e) => {
                error!(error = %e, "symbol task failed");
                state.push_error(format!("symbol task failed: {e}"), None);
            }
        }
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let emitted = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, TickOutcome::Evaluated { decision: DecisionOutcome::Emit, .. }))
        .count();
    let exits = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, TickOutcome::Evaluated { exit: Some(_), .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|(_, o)| !matches!(o, TickOutcome::Evaluated { .. }))
        .count();

    state.ticks_completed.fetch_add(1, Ordering::Relaxed);
    *state.last_tick_at.write() = Some(now);
    state.increment_version();

    debug!(
        symbols = outcomes.len(),
        emitted,
        exits,
        skipped,
        "tick complete"
    );

    outcomes
}

/// Tick driver. Returns once `shutdown` flips to true (or its sender is
/// dropped), after the in-flight tick has finished.
pub async fn run_tick_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let period = std::time::Duration::from_secs(state.config.tick_interval_seconds);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = state.config.tick_interval_seconds,
        symbols = state.symbols.len(),
        "tick loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        run_tick(&state, Utc::now()).await;

        if *shutdown.borrow() {
            break;
        }
    }

    info!(
        ticks = state.ticks_completed.load(Ordering::Relaxed),
        "tick loop stopped"
    );
}
