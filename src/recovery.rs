// =============================================================================
// Recovery: rebuild engine state from the event history after a restart
// =============================================================================
//
// The history sink writes every Signal and PositionClosed as one JSON line.
// Replaying that file at startup restores:
//   - Open positions    every Signal without a matching PositionClosed
//   - Closed journal    every PositionClosed
//   - Ledger            dedup hashes still inside their window, the last
//                       signal per symbol (cooldown) and today's count
//
// Malformed lines are skipped with a warning. Positions on symbols that are
// no longer configured are not reopened: nothing would ever evaluate them.
// The peak of a restored position restarts at its entry price.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::events::EngineEvent;
use crate::types::SymbolKey;

/// Summary of one history replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub events_read: usize,
    pub malformed_lines: usize,
    pub signals_restored: usize,
    pub positions_reopened: usize,
    pub positions_closed: usize,
    /// Unmatched signals on symbols outside the configured universe.
    pub positions_skipped: usize,
}

/// Read every well-formed event from a JSONL history file. A missing file is
/// an empty history.
pub async fn load_history(path: &Path) -> Result<(Vec<EngineEvent>, usize)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no history file yet");
            return Ok((Vec::new(), 0));
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read history file {}", path.display()))
        }
    };

    let mut events = Vec::new();
    let mut malformed = 0;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EngineEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                malformed += 1;
                warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed history line");
            }
        }
    }
    Ok((events, malformed))
}

/// Apply replayed events to a freshly built `AppState`.
pub fn restore(state: &AppState, events: &[EngineEvent], now: DateTime<Utc>) -> RecoverySummary {
    let mut summary = RecoverySummary {
        events_read: events.len(),
        ..RecoverySummary::default()
    };

    let closed_signals: HashSet<&str> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::PositionClosed(c) => Some(c.signal_id.as_str()),
            EngineEvent::Signal(_) => None,
        })
        .collect();

    let mut signals: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Signal(s) => Some(s),
            EngineEvent::PositionClosed(_) => None,
        })
        .collect();
    signals.sort_by_key(|s| s.created_at);

    for signal in signals {
        let key = SymbolKey::new(&signal.symbol, &signal.exchange);
        state.ledger.restore(&key, &signal.dedup_hash, signal.created_at, now);
        state.remember_signal(signal.clone());
        summary.signals_restored += 1;

        if closed_signals.contains(signal.id.as_str()) {
            continue;
        }
        if !state.symbols.contains(&key) {
            warn!(symbol = %key, signal_id = %signal.id, "open position on unconfigured symbol not restored");
            summary.positions_skipped += 1;
            continue;
        }
        match state.positions.open(signal, signal.created_at) {
            Ok(_) => summary.positions_reopened += 1,
            Err(e) => {
                warn!(symbol = %key, signal_id = %signal.id, error = %e, "position not restored");
                summary.positions_skipped += 1;
            }
        }
    }

    for event in events {
        if let EngineEvent::PositionClosed(c) = event {
            state.positions.restore_closed(c);
            summary.positions_closed += 1;
        }
    }

    state.increment_version();
    summary
}

/// Load the history file and restore state from it.
pub async fn recover_from_history(
    path: &Path,
    state: &AppState,
    now: DateTime<Utc>,
) -> Result<RecoverySummary> {
    let (events, malformed) = load_history(path).await?;
    let mut summary = restore(state, &events, now);
    summary.malformed_lines = malformed;

    info!(
        path = %path.display(),
        events = summary.events_read,
        malformed = summary.malformed_lines,
        signals = summary.signals_restored,
        reopened = summary.positions_reopened,
        closed = summary.positions_closed,
        skipped = summary.positions_skipped,
        "state recovered from history"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_gate::Signal;
    use crate::events::{EventBus, EventSink, JsonlHistorySink};
    use crate::exit::ExitReason;
    use crate::position_engine::PositionClosed;
    use crate::runtime_config::EngineConfig;
    use crate::signals::Suppression;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()
    }

    fn state() -> AppState {
        let (bus, _rx) = EventBus::new();
        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["AAAUSDT@binance".into(), "BBBUSDT@binance".into()];
        AppState::new(cfg, bus, t0())
    }

    fn signal(id: &str, symbol: &str, hash: &str, at: DateTime<Utc>) -> Signal {
        Signal {
            id: id.to_string(),
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            entry_price: 1.0,
            take_profit_price: 0.983,
            stop_loss_price: 1.009,
            score: 80.0,
            reasons: vec![],
            dedup_hash: hash.to_string(),
            created_at: at,
        }
    }

    fn closed(signal: &Signal, at: DateTime<Utc>) -> PositionClosed {
        PositionClosed {
            position_id: format!("p-{}", signal.id),
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            exchange: signal.exchange.clone(),
            exit_reason: ExitReason::TakeProfit,
            exit_detail: None,
            entry_price: 1.0,
            exit_price: 0.983,
            realized_pnl_pct: 1.7,
            peak_profit_pct: 1.8,
            opened_at: signal.created_at,
            closed_at: at,
            duration_secs: at.signed_duration_since(signal.created_at).num_seconds(),
        }
    }

    fn history() -> Vec<EngineEvent> {
        let now = t0();
        let done = signal("s1", "BBBUSDT", "h-done", now - Duration::minutes(30));
        vec![
            EngineEvent::Signal(signal("s0", "AAAUSDT", "h-yday", now - Duration::days(1))),
            EngineEvent::PositionClosed(closed(
                &signal("s0", "AAAUSDT", "h-yday", now - Duration::days(1)),
                now - Duration::hours(23),
            )),
            EngineEvent::Signal(done.clone()),
            EngineEvent::PositionClosed(closed(&done, now - Duration::minutes(20))),
            EngineEvent::Signal(signal("s2", "AAAUSDT", "h-live", now - Duration::minutes(2))),
            EngineEvent::Signal(signal("s3", "ZZZUSDT", "h-gone", now - Duration::minutes(40))),
        ]
    }

    #[test]
    fn unmatched_signal_reopens_and_ledger_is_reseeded() {
        let s = state();
        let now = t0();
        let summary = restore(&s, &history(), now);

        assert_eq!(summary.signals_restored, 4);
        assert_eq!(summary.positions_reopened, 1);
        assert_eq!(summary.positions_closed, 2);
        assert_eq!(summary.positions_skipped, 1);

        let open = s.positions.open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].signal_id, "s2");
        assert_eq!(open[0].opened_at, now - Duration::minutes(2));
        assert_eq!(s.positions.closed_positions(10).len(), 2);
        assert_eq!(s.recent_signals(10)[0].id, "s2");

        // s1, s2 and s3 were emitted today; s0 was yesterday.
        assert_eq!(s.ledger.remaining_today(now), 5);
        let a = SymbolKey::new("AAAUSDT", "binance");
        let b = SymbolKey::new("BBBUSDT", "binance");
        assert_eq!(s.ledger.try_admit(&b, "h-live", now), Err(Suppression::Duplicate));
        assert_eq!(s.ledger.try_admit(&a, "fresh", now), Err(Suppression::Cooldown));
        assert_eq!(s.ledger.try_admit(&b, "h-done", now), Ok(()));
    }

    #[tokio::test]
    async fn replays_history_file_written_by_sink() {
        let path = std::env::temp_dir().join(format!("sgnl-recovery-{}.jsonl", uuid::Uuid::new_v4()));
        let sink = JsonlHistorySink::new(&path);
        for event in history() {
            sink.deliver(&event).await.unwrap();
        }
        {
            use tokio::io::AsyncWriteExt;
            let mut f = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
            f.write_all(b"{not json\n\n").await.unwrap();
        }

        let s = state();
        let summary = recover_from_history(&path, &s, t0()).await.unwrap();
        assert_eq!(summary.events_read, 6);
        assert_eq!(summary.malformed_lines, 1);
        assert_eq!(summary.positions_reopened, 1);
        assert!(s.positions.has_open(&SymbolKey::new("AAAUSDT", "binance")));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_history_is_empty() {
        let path = std::env::temp_dir().join(format!("sgnl-absent-{}.jsonl", uuid::Uuid::new_v4()));
        let s = state();
        let summary = recover_from_history(&path, &s, t0()).await.unwrap();
        assert_eq!(summary, RecoverySummary::default());
        assert!(s.positions.open_positions().is_empty());
    }
}
