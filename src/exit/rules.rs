// =============================================================================
// Exit Rules: ordered, first match wins
// =============================================================================
//
// Evaluated for an Open short on every tick, after the position book has
// absorbed the current price:
//
//   1. Emergency     market turned against the short (BTC pump, liquidity
//                    flip to the bid, or an aggressive buy sweep)
//   2. HardStop      loss reached hard_stop_loss_pct
//   3. TrailingStop  trailing armed and profit gave back trail_giveback_pct
//                    from the peak
//   4. TakeProfit    profit reached tp_pct
//   5. Timeout       held for max_hold_seconds
//
// Percentage comparisons allow PCT_EPSILON of float noise.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::position_engine::Position;
use crate::runtime_config::EngineConfig;
use crate::types::{FeatureSnapshot, PCT_EPSILON};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    Emergency,
    HardStop,
    TrailingStop,
    TakeProfit,
    Timeout,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emergency => write!(f, "Emergency"),
            Self::HardStop => write!(f, "HardStop"),
            Self::TrailingStop => write!(f, "TrailingStop"),
            Self::TakeProfit => write!(f, "TakeProfit"),
            Self::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Rule order. The first rule that fires decides the exit.
pub const EXIT_RULES: [ExitReason; 5] = [
    ExitReason::Emergency,
    ExitReason::HardStop,
    ExitReason::TrailingStop,
    ExitReason::TakeProfit,
    ExitReason::Timeout,
];

/// What kind of adverse market event forced an emergency exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyKind {
    BtcPump,
    LiquidityFlip,
    BuySweep,
}

impl std::fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BtcPump => write!(f, "BTC_PUMP"),
            Self::LiquidityFlip => write!(f, "LIQUIDITY_FLIP"),
            Self::BuySweep => write!(f, "BUY_SWEEP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub exit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Market readings the emergency rule looks at. Every field may be missing;
/// a missing reading never triggers an emergency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketContext {
    pub btc_microtrend: Option<f64>,
    /// 2 * ask_dominance - 1, in [-1, 1]. Negative means the bid dominates.
    pub book_imbalance: Option<f64>,
    pub sweep_score: Option<f64>,
    pub aggressive_sell_ratio: Option<f64>,
}

impl MarketContext {
    pub fn from_snapshot(features: &FeatureSnapshot) -> Self {
        let (f, _) = features.sanitized();
        Self {
            btc_microtrend: f.btc_microtrend,
            book_imbalance: f.ask_dominance.map(|a| 2.0 * a - 1.0),
            sweep_score: f.sweep_score,
            aggressive_sell_ratio: f.aggressive_sell_ratio,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitEvaluator {
    hard_stop_loss_pct: f64,
    trail_giveback_pct: f64,
    tp_pct: f64,
    max_hold: Duration,
    emergency_btc_pump: f64,
    liquidity_flip_imbalance: f64,
    buy_sweep_sell_ratio: f64,
    sweep_detect_score: f64,
}

impl ExitEvaluator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            hard_stop_loss_pct: config.hard_stop_loss_pct,
            trail_giveback_pct: config.trail_giveback_pct,
            tp_pct: config.tp_pct,
            max_hold: config.max_hold(),
            emergency_btc_pump: config.emergency_btc_pump,
            liquidity_flip_imbalance: config.liquidity_flip_imbalance,
            buy_sweep_sell_ratio: config.buy_sweep_sell_ratio,
            sweep_detect_score: config.min_sweep_score,
        }
    }

    /// Decide whether `position` should close at `price`. Pure: reads the
    /// position as already updated with this price and never mutates it.
    pub fn evaluate(
        &self,
        position: &Position,
        price: f64,
        ctx: &MarketContext,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        let profit = position.profit_pct_at(price);

        for rule in EXIT_RULES {
            let fired = match rule {
                ExitReason::Emergency => self.emergency(ctx).map(|k| Some(k.to_string())),
                ExitReason::HardStop => {
                    (profit <= -self.hard_stop_loss_pct + PCT_EPSILON).then_some(None)
                }
                ExitReason::TrailingStop => (position.trailing_active
                    && position.peak_profit_pct - profit + PCT_EPSILON
                        >= self.trail_giveback_pct)
                    .then_some(None),
                ExitReason::TakeProfit => {
                    (profit + PCT_EPSILON >= self.tp_pct).then_some(None)
                }
                ExitReason::Timeout => {
                    (now.signed_duration_since(position.opened_at) >= self.max_hold)
                        .then_some(None)
                }
            };

            if let Some(detail) = fired {
                debug!(
                    id = %position.id,
                    symbol = %position.symbol,
                    reason = %rule,
                    detail = ?detail,
                    price,
                    profit_pct = profit,
                    peak_profit_pct = position.peak_profit_pct,
                    "exit rule fired"
                );
                return Some(ExitDecision {
                    reason: rule,
                    exit_price: price,
                    detail,
                });
            }
        }

        None
    }

    /// First emergency condition present in `ctx`, if any.
    pub fn emergency(&self, ctx: &MarketContext) -> Option<EmergencyKind> {
        if ctx
            .btc_microtrend
            .is_some_and(|b| b + PCT_EPSILON >= self.emergency_btc_pump)
        {
            return Some(EmergencyKind::BtcPump);
        }
        if ctx
            .book_imbalance
            .is_some_and(|i| i <= self.liquidity_flip_imbalance + PCT_EPSILON)
        {
            return Some(EmergencyKind::LiquidityFlip);
        }
        let sweep = ctx
            .sweep_score
            .is_some_and(|s| s + PCT_EPSILON >= self.sweep_detect_score);
        if sweep
            && ctx
                .aggressive_sell_ratio
                .is_some_and(|r| r < self.buy_sweep_sell_ratio)
        {
            return Some(EmergencyKind::BuySweep);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_gate::Signal;
    use crate::position_engine::PositionBook;
    use crate::types::SymbolKey;
    use chrono::TimeZone;

    const P: f64 = 100.0;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap()
    }

    fn key() -> SymbolKey {
        SymbolKey::new("ABCUSDT", "binance")
    }

    fn open_book() -> PositionBook {
        let book = PositionBook::new(EngineConfig::default().trail_activate_pct);
        let signal = Signal {
            id: "sig-1".to_string(),
            symbol: "ABCUSDT".to_string(),
            exchange: "binance".to_string(),
            entry_price: P,
            take_profit_price: P * 0.983,
            stop_loss_price: P * 1.009,
            score: 80.0,
            reasons: vec![],
            dedup_hash: "h".to_string(),
            created_at: t0(),
        };
        book.open(&signal, t0()).unwrap();
        book
    }

    fn step(book: &PositionBook, price: f64, ctx: &MarketContext) -> Option<ExitDecision> {
        let pos = book.update(&key(), price).unwrap();
        ExitEvaluator::new(&EngineConfig::default()).evaluate(&pos, price, ctx, t0())
    }

    #[test]
    fn trailing_stop_after_giveback() {
        let book = open_book();
        let calm = MarketContext::default();

        assert!(step(&book, P * 0.989, &calm).is_none());
        assert!(book.get_open(&key()).unwrap().trailing_active);

        let exit = step(&book, P * 0.993, &calm).unwrap();
        assert_eq!(exit.reason, ExitReason::TrailingStop);
        assert!((exit.exit_price - 99.3).abs() < 1e-9);
    }

    #[test]
    fn hard_stop_on_adverse_move() {
        let book = open_book();
        let exit = step(&book, P * 1.013, &MarketContext::default()).unwrap();
        assert_eq!(exit.reason, ExitReason::HardStop);
    }

    #[test]
    fn take_profit_at_target() {
        let book = open_book();
        let exit = step(&book, P * (1.0 - 0.017), &MarketContext::default()).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn emergency_outranks_hard_stop() {
        let book = open_book();
        let ctx = MarketContext {
            btc_microtrend: Some(0.85),
            ..Default::default()
        };
        let exit = step(&book, P * 1.02, &ctx).unwrap();
        assert_eq!(exit.reason, ExitReason::Emergency);
        assert_eq!(exit.detail.as_deref(), Some("BTC_PUMP"));
    }

    #[test]
    fn hard_stop_outranks_trailing() {
        let book = open_book();
        let calm = MarketContext::default();
        assert!(step(&book, P * 0.99, &calm).is_none());
        // Armed trail, then a spike through the hard stop: both fire, hard stop wins.
        let exit = step(&book, P * 1.015, &calm).unwrap();
        assert_eq!(exit.reason, ExitReason::HardStop);
    }

    #[test]
    fn timeout_after_max_hold() {
        let book = open_book();
        let pos = book.update(&key(), P * 0.999).unwrap();
        let eval = ExitEvaluator::new(&EngineConfig::default());
        let ctx = MarketContext::default();

        assert!(eval
            .evaluate(&pos, P * 0.999, &ctx, t0() + Duration::seconds(3599))
            .is_none());
        let exit = eval
            .evaluate(&pos, P * 0.999, &ctx, t0() + Duration::seconds(3600))
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Timeout);
    }

    #[test]
    fn emergency_sources() {
        let eval = ExitEvaluator::new(&EngineConfig::default());

        let mut snap = FeatureSnapshot::empty(&key(), t0());
        snap.ask_dominance = Some(0.3);
        assert_eq!(
            eval.emergency(&MarketContext::from_snapshot(&snap)),
            Some(EmergencyKind::LiquidityFlip)
        );

        snap.ask_dominance = Some(0.6);
        snap.sweep_score = Some(0.7);
        snap.aggressive_sell_ratio = Some(0.2);
        assert_eq!(
            eval.emergency(&MarketContext::from_snapshot(&snap)),
            Some(EmergencyKind::BuySweep)
        );

        snap.aggressive_sell_ratio = Some(0.8);
        assert_eq!(eval.emergency(&MarketContext::from_snapshot(&snap)), None);
        assert_eq!(eval.emergency(&MarketContext::default()), None);
    }

    #[test]
    fn untriggered_position_stays_open() {
        let book = open_book();
        assert!(step(&book, P * 0.998, &MarketContext::default()).is_none());
        assert!(step(&book, P * 1.005, &MarketContext::default()).is_none());
    }
}
