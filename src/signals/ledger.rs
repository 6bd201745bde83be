// =============================================================================
// Signal Ledger: dedup registry, per-symbol cooldown and daily cap
// =============================================================================
//
// The single synchronization point for everything that rate-limits signal
// emission across symbol workers:
//   1. Dedup      : an unexpired dedup hash blocks an equivalent signal.
//   2. Cooldown   : minimum spacing between signals on the same symbol.
//   3. Daily cap  : global number of signals per UTC calendar day.
//
// `try_admit` checks all three and, on success, records the signal in the
// same critical section, so two workers can never both pass a check that
// only one of them should pass.
//
// The daily counter resets automatically when the date rolls over.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::signals::dedup::DedupRegistry;
use crate::types::SymbolKey;

/// Why the ledger refused a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Suppression {
    Duplicate,
    Cooldown,
    DailyCap,
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "Duplicate"),
            Self::Cooldown => write!(f, "Cooldown"),
            Self::DailyCap => write!(f, "DailyCap"),
        }
    }
}

/// Serialisable view of the ledger for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub current_date: NaiveDate,
    pub signals_today: u32,
    pub max_daily_signals: u32,
    pub remaining_today: u32,
    pub active_dedup_hashes: usize,
    /// Seconds of cooldown left per symbol (only symbols still cooling down).
    pub cooldowns: HashMap<String, i64>,
}

struct Inner {
    dedup: DedupRegistry,
    last_signal: HashMap<SymbolKey, DateTime<Utc>>,
    signals_today: u32,
    current_date: NaiveDate,
}

pub struct SignalLedger {
    state: Mutex<Inner>,
    cooldown: Duration,
    dedup_window: Duration,
    max_daily_signals: u32,
}

impl SignalLedger {
    pub fn new(
        cooldown: Duration,
        dedup_window: Duration,
        max_daily_signals: u32,
        now: DateTime<Utc>,
    ) -> Self {
        info!(
            cooldown_secs = cooldown.num_seconds(),
            dedup_window_secs = dedup_window.num_seconds(),
            max_daily_signals,
            "SignalLedger initialised"
        );

        Self {
            state: Mutex::new(Inner {
                dedup: DedupRegistry::new(),
                last_signal: HashMap::new(),
                signals_today: 0,
                current_date: now.date_naive(),
            }),
            cooldown,
            dedup_window,
            max_daily_signals,
        }
    }

    /// Check dedup, cooldown and daily cap for a prospective signal and, if
    /// all pass, record it.
    pub fn try_admit(
        &self,
        key: &SymbolKey,
        dedup_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Suppression> {
        let mut s = self.state.lock();
        Self::roll_date(&mut s, now);

        // 1. Dedup
        if s.dedup.is_active(dedup_hash, now) {
            debug!(symbol = %key, dedup_hash, "signal suppressed: duplicate");
            return Err(Suppression::Duplicate);
        }

        // 2. Cooldown
        if let Some(last) = s.last_signal.get(key) {
            if now.signed_duration_since(*last) < self.cooldown {
                debug!(symbol = %key, last = %last, "signal suppressed: cooldown");
                return Err(Suppression::Cooldown);
            }
        }

        // 3. Daily cap
        if s.signals_today >= self.max_daily_signals {
            debug!(
                symbol = %key,
                signals_today = s.signals_today,
                limit = self.max_daily_signals,
                "signal suppressed: daily cap"
            );
            return Err(Suppression::DailyCap);
        }

        s.dedup.purge_expired(now);
        s.dedup.register(dedup_hash, now, self.dedup_window);
        s.last_signal.insert(key.clone(), now);
        s.signals_today += 1;

        debug!(
            symbol = %key,
            dedup_hash,
            signals_today = s.signals_today,
            "signal admitted by ledger"
        );
        Ok(())
    }

    /// Re-seed the ledger with a signal emitted before a restart: its dedup
    /// hash (while still inside the window), the symbol's cooldown anchor and
    /// today's count. Signals stamped after `now` are ignored.
    pub fn restore(&self, key: &SymbolKey, dedup_hash: &str, at: DateTime<Utc>, now: DateTime<Utc>) {
        if at > now {
            return;
        }
        let mut s = self.state.lock();
        Self::roll_date(&mut s, now);

        if now.signed_duration_since(at) < self.dedup_window {
            s.dedup.register(dedup_hash, at, self.dedup_window);
        }
        if s.last_signal.get(key).map_or(true, |last| at > *last) {
            s.last_signal.insert(key.clone(), at);
        }
        if at.date_naive() == s.current_date {
            s.signals_today += 1;
        }
    }

    /// Signals still allowed today.
    pub fn remaining_today(&self, now: DateTime<Utc>) -> u32 {
        let mut s = self.state.lock();
        Self::roll_date(&mut s, now);
        self.max_daily_signals.saturating_sub(s.signals_today)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> LedgerSnapshot {
        let mut s = self.state.lock();
        Self::roll_date(&mut s, now);
        s.dedup.purge_expired(now);

        let cooldowns = s
            .last_signal
            .iter()
            .filter_map(|(key, last)| {
                let left = self.cooldown - now.signed_duration_since(*last);
                (left > Duration::zero()).then(|| (key.to_string(), left.num_seconds()))
            })
            .collect();

        LedgerSnapshot {
            current_date: s.current_date,
            signals_today: s.signals_today,
            max_daily_signals: self.max_daily_signals,
            remaining_today: self.max_daily_signals.saturating_sub(s.signals_today),
            active_dedup_hashes: s.dedup.len(),
            cooldowns,
        }
    }

    /// If the UTC calendar date has changed, reset the daily counter.
    fn roll_date(s: &mut Inner, now: DateTime<Utc>) {
        let today = now.date_naive();
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                signals_yesterday = s.signals_today,
                "date rolled, resetting daily signal counter"
            );
            s.signals_today = 0;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for SignalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalLedger")
            .field("cooldown", &self.cooldown)
            .field("dedup_window", &self.dedup_window)
            .field("max_daily_signals", &self.max_daily_signals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn ledger(cooldown: i64, max_daily: u32) -> SignalLedger {
        SignalLedger::new(
            Duration::seconds(cooldown),
            Duration::seconds(900),
            max_daily,
            t0(),
        )
    }

    #[test]
    fn duplicate_blocked_until_window_expires() {
        let l = ledger(0, 8);
        let a = SymbolKey::new("AAAUSDT", "binance");
        let b = SymbolKey::new("AAAUSDT", "bybit");

        assert_eq!(l.try_admit(&a, "h1", t0()), Ok(()));
        // Same content from another venue is still a duplicate.
        assert_eq!(
            l.try_admit(&b, "h1", t0() + Duration::seconds(60)),
            Err(Suppression::Duplicate)
        );
        assert_eq!(l.try_admit(&b, "h1", t0() + Duration::seconds(900)), Ok(()));
    }

    #[test]
    fn cooldown_blocks_same_symbol_only() {
        let l = ledger(300, 8);
        let a = SymbolKey::new("AAAUSDT", "binance");
        let b = SymbolKey::new("BBBUSDT", "binance");

        assert_eq!(l.try_admit(&a, "h1", t0()), Ok(()));
        assert_eq!(
            l.try_admit(&a, "h2", t0() + Duration::seconds(1)),
            Err(Suppression::Cooldown)
        );
        assert_eq!(l.try_admit(&b, "h3", t0() + Duration::seconds(1)), Ok(()));
        assert_eq!(l.try_admit(&a, "h4", t0() + Duration::seconds(300)), Ok(()));
    }

    #[test]
    fn rejected_attempts_do_not_consume_budget() {
        let l = ledger(300, 2);
        let a = SymbolKey::new("AAAUSDT", "binance");
        assert_eq!(l.try_admit(&a, "h1", t0()), Ok(()));
        assert_eq!(l.try_admit(&a, "h1", t0()), Err(Suppression::Duplicate));
        assert_eq!(l.try_admit(&a, "h2", t0()), Err(Suppression::Cooldown));
        assert_eq!(l.remaining_today(t0()), 1);
    }

    #[test]
    fn daily_cap_and_rollover() {
        let l = ledger(0, 2);
        let now = t0();
        for (i, sym) in ["AAAUSDT", "BBBUSDT"].iter().enumerate() {
            let key = SymbolKey::new(*sym, "binance");
            assert_eq!(l.try_admit(&key, &format!("h{i}"), now), Ok(()));
        }
        let c = SymbolKey::new("CCCUSDT", "binance");
        assert_eq!(l.try_admit(&c, "h9", now), Err(Suppression::DailyCap));
        assert_eq!(l.remaining_today(now), 0);

        let tomorrow = Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 1).unwrap();
        assert_eq!(l.remaining_today(tomorrow), 2);
        assert_eq!(l.try_admit(&c, "h9", tomorrow), Ok(()));
    }

    #[test]
    fn snapshot_reports_cooldowns() {
        let l = ledger(300, 8);
        let a = SymbolKey::new("AAAUSDT", "binance");
        l.try_admit(&a, "h1", t0()).unwrap();

        let snap = l.snapshot(t0() + Duration::seconds(100));
        assert_eq!(snap.signals_today, 1);
        assert_eq!(snap.remaining_today, 7);
        assert_eq!(snap.active_dedup_hashes, 1);
        assert_eq!(snap.cooldowns.get("AAAUSDT@binance"), Some(&200));

        let later = l.snapshot(t0() + Duration::seconds(1000));
        assert!(later.cooldowns.is_empty());
        assert_eq!(later.active_dedup_hashes, 0);
    }

    #[test]
    fn restored_signals_reseed_every_limit() {
        let l = ledger(300, 3);
        let a = SymbolKey::new("AAAUSDT", "binance");
        let b = SymbolKey::new("BBBUSDT", "binance");
        let now = t0();

        l.restore(&a, "h1", now - Duration::seconds(120), now);
        l.restore(&b, "h2", now - Duration::seconds(1_000), now);
        l.restore(&b, "old", now - Duration::days(1), now);
        l.restore(&b, "ahead", now + Duration::seconds(30), now);

        assert_eq!(l.remaining_today(now), 1);
        assert_eq!(l.try_admit(&b, "h1", now), Err(Suppression::Duplicate));
        assert_eq!(l.try_admit(&a, "h3", now), Err(Suppression::Cooldown));
        // h2 left its dedup window and BBB's cooldown has passed.
        assert_eq!(l.try_admit(&b, "h2", now), Ok(()));
        assert_eq!(l.remaining_today(now), 0);
    }

    #[test]
    fn concurrent_admission_respects_cap() {
        let l = Arc::new(ledger(0, 8));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let l = Arc::clone(&l);
                std::thread::spawn(move || {
                    let key = SymbolKey::new(format!("S{i}USDT"), "binance");
                    l.try_admit(&key, &format!("h{i}"), t0()).is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 8);
    }
}
