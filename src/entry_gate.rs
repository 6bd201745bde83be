// =============================================================================
// Entry Gate: seven hard conditions, then ledger admission
// =============================================================================
//
// A short signal is emitted only if EVERY condition holds:
//
//   1. ScoreBelowMin        UPS >= score_min
//   2. AskImbalanceTooLow   ask_dominance >= min_ask_imbalance
//   3. SweepTooWeak         sweep_score >= min_sweep_score
//   4. OiDivergenceTooLow   oi_divergence > 0 and >= min_oi_divergence
//   5. SpreadTooWide        spread_pct < max_spread_pct (missing spread fails)
//   6. BtcPumping           btc_microtrend < btc_pump_threshold
//                           (missing BTC data counts as not pumping)
//   7. PositionOpen         no Open position on the symbol
//
// Two more block an entry when the anchor price is unusable: it is missing
// (PriceUnavailable) or above the optional `max_entry_price` (PriceAboveMax).
//
// A missing or invalid gating feature fails its condition. After the
// conditions pass, the signal prices and dedup hash are computed and the
// SignalLedger decides on duplicate / cooldown / daily-cap suppression.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::runtime_config::EngineConfig;
use crate::signals::{dedup_hash, Score, SignalLedger, Suppression};
use crate::types::{FeatureSnapshot, PCT_EPSILON};

/// A hard entry condition that did not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateCondition {
    ScoreBelowMin,
    AskImbalanceTooLow,
    SweepTooWeak,
    OiDivergenceTooLow,
    SpreadTooWide,
    BtcPumping,
    PositionOpen,
    /// No usable price to anchor the signal on.
    PriceUnavailable,
    /// Price above the configured eligibility ceiling.
    PriceAboveMax,
}

impl std::fmt::Display for GateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ScoreBelowMin => "ScoreBelowMin",
            Self::AskImbalanceTooLow => "AskImbalanceTooLow",
            Self::SweepTooWeak => "SweepTooWeak",
            Self::OiDivergenceTooLow => "OiDivergenceTooLow",
            Self::SpreadTooWide => "SpreadTooWide",
            Self::BtcPumping => "BtcPumping",
            Self::PositionOpen => "PositionOpen",
            Self::PriceUnavailable => "PriceUnavailable",
            Self::PriceAboveMax => "PriceAboveMax",
        };
        write!(f, "{s}")
    }
}

/// An admitted short-entry recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub score: f64,
    pub reasons: Vec<String>,
    pub dedup_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Emit(Signal),
    /// One or more hard conditions failed (in check order, never empty).
    Blocked(Vec<GateCondition>),
    /// Conditions passed but the ledger refused the signal.
    Suppressed(Suppression),
}

// =============================================================================
// Counters
// =============================================================================

/// Monotonic counters of gate outcomes, exposed on the dashboard.
#[derive(Debug, Default)]
pub struct GateStats {
    evaluated: AtomicU64,
    emitted: AtomicU64,
    blocked: AtomicU64,
    duplicate: AtomicU64,
    cooldown: AtomicU64,
    daily_cap: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatsSnapshot {
    pub evaluated: u64,
    pub emitted: u64,
    pub blocked: u64,
    pub duplicate: u64,
    pub cooldown: u64,
    pub daily_cap: u64,
}

impl GateStats {
    pub fn record(&self, verdict: &Verdict) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            Verdict::Emit(_) => &self.emitted,
            Verdict::Blocked(_) => &self.blocked,
            Verdict::Suppressed(Suppression::Duplicate) => &self.duplicate,
            Verdict::Suppressed(Suppression::Cooldown) => &self.cooldown,
            Verdict::Suppressed(Suppression::DailyCap) => &self.daily_cap,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GateStatsSnapshot {
        GateStatsSnapshot {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            cooldown: self.cooldown.load(Ordering::Relaxed),
            daily_cap: self.daily_cap.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// EntryGate
// =============================================================================

/// Thresholds copied out of the engine config at startup.
#[derive(Debug, Clone)]
pub struct EntryGate {
    score_min: f64,
    min_ask_imbalance: f64,
    min_sweep_score: f64,
    min_oi_divergence: f64,
    max_spread_pct: f64,
    btc_pump_threshold: f64,
    max_entry_price: Option<f64>,
    tp_pct: f64,
    sl_pct: f64,
}

impl EntryGate {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            score_min: config.score_min,
            min_ask_imbalance: config.min_ask_imbalance,
            min_sweep_score: config.min_sweep_score,
            min_oi_divergence: config.min_oi_divergence,
            max_spread_pct: config.max_spread_pct,
            btc_pump_threshold: config.btc_pump_threshold,
            max_entry_price: config.max_entry_price,
            tp_pct: config.tp_pct,
            sl_pct: config.effective_sl_pct(),
        }
    }

    /// Every hard condition that fails for this input, in check order.
    pub fn failed_conditions(
        &self,
        score: &Score,
        features: &FeatureSnapshot,
        has_open_position: bool,
    ) -> Vec<GateCondition> {
        let (f, _) = features.sanitized();
        let mut failed = Vec::new();

        if score.value + PCT_EPSILON < self.score_min {
            failed.push(GateCondition::ScoreBelowMin);
        }
        if !f
            .ask_dominance
            .is_some_and(|a| a + PCT_EPSILON >= self.min_ask_imbalance)
        {
            failed.push(GateCondition::AskImbalanceTooLow);
        }
        if !f
            .sweep_score
            .is_some_and(|s| s + PCT_EPSILON >= self.min_sweep_score)
        {
            failed.push(GateCondition::SweepTooWeak);
        }
        if !f
            .oi_divergence
            .is_some_and(|oi| oi > 0.0 && oi + PCT_EPSILON >= self.min_oi_divergence)
        {
            failed.push(GateCondition::OiDivergenceTooLow);
        }
        if !f.spread_pct.is_some_and(|s| s < self.max_spread_pct) {
            failed.push(GateCondition::SpreadTooWide);
        }
        if f
            .btc_microtrend
            .is_some_and(|b| b + PCT_EPSILON >= self.btc_pump_threshold)
        {
            failed.push(GateCondition::BtcPumping);
        }
        if has_open_position {
            failed.push(GateCondition::PositionOpen);
        }
        match (f.price, self.max_entry_price) {
            (None, _) => failed.push(GateCondition::PriceUnavailable),
            (Some(p), Some(cap)) if p > cap => failed.push(GateCondition::PriceAboveMax),
            _ => {}
        }

        failed
    }

    /// Take-profit and stop-loss prices for a short entered at `entry`.
    pub fn signal_prices(&self, entry: f64) -> (f64, f64) {
        let tp = entry * (1.0 - self.tp_pct / 100.0);
        let sl = entry * (1.0 + self.sl_pct / 100.0);
        (tp, sl)
    }

    /// Run the hard conditions, then ask the ledger for admission. The ledger
    /// is only touched when every condition passes.
    pub fn evaluate(
        &self,
        score: &Score,
        features: &FeatureSnapshot,
        has_open_position: bool,
        ledger: &SignalLedger,
        now: DateTime<Utc>,
    ) -> Verdict {
        let failed = self.failed_conditions(score, features, has_open_position);
        if !failed.is_empty() {
            debug!(
                symbol = %features.symbol,
                exchange = %features.exchange,
                score = score.value,
                failed = ?failed,
                "entry gate blocked"
            );
            return Verdict::Blocked(failed);
        }

        let key = features.key();
        let entry = match features.price {
            Some(p) => p,
            None => return Verdict::Blocked(vec![GateCondition::PriceUnavailable]),
        };
        let hash = dedup_hash(&key.symbol, entry, score.value);

        if let Err(reason) = ledger.try_admit(&key, &hash, now) {
            return Verdict::Suppressed(reason);
        }

        let (take_profit_price, stop_loss_price) = self.signal_prices(entry);
        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: key.symbol,
            exchange: key.exchange,
            entry_price: entry,
            take_profit_price,
            stop_loss_price,
            score: score.value,
            reasons: score.reasons.clone(),
            dedup_hash: hash,
            created_at: now,
        };

        info!(
            id = %signal.id,
            symbol = %signal.symbol,
            exchange = %signal.exchange,
            entry = signal.entry_price,
            tp = signal.take_profit_price,
            sl = signal.stop_loss_price,
            score = signal.score,
            "SHORT signal emitted"
        );

        Verdict::Emit(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Scorer;
    use crate::types::SymbolKey;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap()
    }

    fn passing_features() -> FeatureSnapshot {
        let mut f = FeatureSnapshot::empty(&SymbolKey::new("ABCUSDT", "binance"), t0());
        f.price = Some(2.0);
        f.ask_dominance = Some(0.9);
        f.bid_weakness = Some(0.8);
        f.sweep_score = Some(0.9);
        f.oi_divergence = Some(0.8);
        f.funding_rate = Some(0.0008);
        f.short_momentum = Some(0.7);
        f.vwap_distance = Some(0.008);
        f.spread_pct = Some(0.1);
        f.btc_microtrend = Some(-0.5);
        f
    }

    fn setup() -> (EntryGate, SignalLedger) {
        let cfg = EngineConfig::default();
        let ledger =
            SignalLedger::new(cfg.cooldown(), cfg.dedup_window(), cfg.max_daily_signals, t0());
        (EntryGate::new(&cfg), ledger)
    }

    fn run(gate: &EntryGate, ledger: &SignalLedger, f: &FeatureSnapshot, open: bool) -> Verdict {
        let score = Scorer::default().score(f);
        gate.evaluate(&score, f, open, ledger, t0())
    }

    #[test]
    fn all_conditions_pass_emits_signal() {
        let (gate, ledger) = setup();
        let Verdict::Emit(signal) = run(&gate, &ledger, &passing_features(), false) else {
            panic!("expected a signal");
        };

        assert_eq!(signal.symbol, "ABCUSDT");
        assert!((signal.take_profit_price - 2.0 * (1.0 - 0.017)).abs() < 1e-12);
        assert!((signal.stop_loss_price - 2.0 * (1.0 + 0.009)).abs() < 1e-12);
        assert!(signal.take_profit_price < signal.entry_price);
        assert!(signal.stop_loss_price > signal.entry_price);
        assert!(!signal.reasons.is_empty());
        assert_eq!(signal.dedup_hash.len(), 32);
    }

    #[test]
    fn each_single_condition_flip_blocks() {
        let flips: Vec<(GateCondition, Box<dyn Fn(&mut FeatureSnapshot)>)> = vec![
            (GateCondition::AskImbalanceTooLow, Box::new(|f: &mut FeatureSnapshot| f.ask_dominance = Some(0.59))),
            (GateCondition::SweepTooWeak, Box::new(|f: &mut FeatureSnapshot| f.sweep_score = None)),
            (GateCondition::OiDivergenceTooLow, Box::new(|f: &mut FeatureSnapshot| f.oi_divergence = Some(0.29))),
            (GateCondition::SpreadTooWide, Box::new(|f: &mut FeatureSnapshot| f.spread_pct = Some(0.5))),
            (GateCondition::SpreadTooWide, Box::new(|f: &mut FeatureSnapshot| f.spread_pct = None)),
            (GateCondition::BtcPumping, Box::new(|f: &mut FeatureSnapshot| f.btc_microtrend = Some(0.4))),
            (GateCondition::PriceUnavailable, Box::new(|f: &mut FeatureSnapshot| f.price = None)),
        ];

        for (expected, flip) in flips {
            let (gate, ledger) = setup();
            let mut f = passing_features();
            flip(&mut f);
            let score = Scorer::default().score(&passing_features());
            let verdict = gate.evaluate(&score, &f, false, &ledger, t0());
            assert_eq!(verdict, Verdict::Blocked(vec![expected]), "flip {expected}");
            // A blocked evaluation never touches the ledger.
            assert_eq!(ledger.remaining_today(t0()), 8);
        }
    }

    #[test]
    fn low_score_blocks() {
        let (gate, ledger) = setup();
        let f = passing_features();
        let mut score = Scorer::default().score(&f);
        score.value = 71.9;
        assert_eq!(
            gate.evaluate(&score, &f, false, &ledger, t0()),
            Verdict::Blocked(vec![GateCondition::ScoreBelowMin])
        );
    }

    #[test]
    fn open_position_blocks() {
        let (gate, ledger) = setup();
        assert_eq!(
            run(&gate, &ledger, &passing_features(), true),
            Verdict::Blocked(vec![GateCondition::PositionOpen])
        );
    }

    #[test]
    fn missing_btc_is_not_pumping() {
        let (gate, ledger) = setup();
        let mut f = passing_features();
        f.btc_microtrend = None;
        f.oi_divergence = Some(1.0);
        f.short_momentum = Some(1.0);
        assert!(matches!(run(&gate, &ledger, &f, false), Verdict::Emit(_)));
    }

    #[test]
    fn price_above_ceiling_blocks_entry() {
        let mut cfg = EngineConfig::default();
        cfg.max_entry_price = Some(1.5);
        let gate = EntryGate::new(&cfg);
        let ledger =
            SignalLedger::new(cfg.cooldown(), cfg.dedup_window(), cfg.max_daily_signals, t0());
        assert_eq!(
            run(&gate, &ledger, &passing_features(), false),
            Verdict::Blocked(vec![GateCondition::PriceAboveMax])
        );

        cfg.max_entry_price = Some(2.0);
        let gate = EntryGate::new(&cfg);
        assert!(matches!(
            run(&gate, &ledger, &passing_features(), false),
            Verdict::Emit(_)
        ));
    }

    #[test]
    fn negative_oi_divergence_fails_even_with_zero_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.min_oi_divergence = 0.0;
        let gate = EntryGate::new(&cfg);
        let mut f = passing_features();
        f.oi_divergence = Some(0.0);
        let score = Scorer::default().score(&passing_features());
        assert_eq!(
            gate.failed_conditions(&score, &f, false),
            vec![GateCondition::OiDivergenceTooLow]
        );
    }

    #[test]
    fn repeat_signal_is_suppressed_by_ledger() {
        let (gate, ledger) = setup();
        let f = passing_features();
        assert!(matches!(run(&gate, &ledger, &f, false), Verdict::Emit(_)));
        assert_eq!(
            run(&gate, &ledger, &f, false),
            Verdict::Suppressed(Suppression::Duplicate)
        );

        let mut moved = f.clone();
        moved.price = Some(1.9);
        let score = Scorer::default().score(&moved);
        assert_eq!(
            gate.evaluate(&score, &moved, false, &ledger, t0() + Duration::seconds(10)),
            Verdict::Suppressed(Suppression::Cooldown)
        );
    }

    #[test]
    fn stats_count_each_outcome() {
        let stats = GateStats::default();
        stats.record(&Verdict::Blocked(vec![GateCondition::SweepTooWeak]));
        stats.record(&Verdict::Suppressed(Suppression::Cooldown));
        stats.record(&Verdict::Suppressed(Suppression::Cooldown));
        let snap = stats.snapshot();
        assert_eq!(snap.evaluated, 3);
        assert_eq!(snap.blocked, 1);
        assert_eq!(snap.cooldown, 2);
        assert_eq!(snap.emitted, 0);
    }
}
