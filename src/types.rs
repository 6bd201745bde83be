// =============================================================================
// Shared types used across the SGNL decision engine
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tolerance applied to percentage threshold comparisons so that values which
/// are equal on paper (e.g. a 0.4% giveback computed from two prices) are not
/// rejected by floating-point noise.
pub const PCT_EPSILON: f64 = 1e-9;

/// Identity of a tradable instrument on a given venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolKey {
    pub symbol: String,
    pub exchange: String,
}

impl SymbolKey {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().trim().to_uppercase(),
            exchange: exchange.into().trim().to_lowercase(),
        }
    }

    /// Parse `SYMBOL@exchange`. A bare symbol defaults to `binance`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('@') {
            Some((sym, ex)) if !sym.trim().is_empty() && !ex.trim().is_empty() => {
                Some(Self::new(sym, ex))
            }
            Some(_) => None,
            None => Some(Self::new(raw, "binance")),
        }
    }
}

impl std::fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.exchange)
    }
}

// =============================================================================
// FeatureSnapshot
// =============================================================================

/// One normalized feature vector for a symbol at a point in time, as supplied
/// by the external feature pipeline.
///
/// Every numeric field is nullable. Values that are non-finite or outside the
/// documented range are neutralized by [`FeatureSnapshot::sanitized`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub symbol: String,
    pub exchange: String,
    pub timestamp: DateTime<Utc>,

    /// Last / mark price. Required for entries and exit evaluation.
    #[serde(default)]
    pub price: Option<f64>,
    /// Ask share of top-of-book depth, [0, 1]. 0.5 is balanced.
    #[serde(default)]
    pub ask_dominance: Option<f64>,
    /// Exhaustion of resting bids, [0, 1].
    #[serde(default)]
    pub bid_weakness: Option<f64>,
    /// Strength of a detected aggressive sell sweep, [0, 1].
    #[serde(default)]
    pub sweep_score: Option<f64>,
    /// OI rising while price falls is positive, [-1, 1].
    #[serde(default)]
    pub oi_divergence: Option<f64>,
    /// Raw perpetual funding rate as a fraction, [-0.05, 0.05].
    #[serde(default)]
    pub funding_rate: Option<f64>,
    /// Normalized downside momentum, [0, 1].
    #[serde(default)]
    pub short_momentum: Option<f64>,
    /// (price - vwap) / vwap, [-0.2, 0.2].
    #[serde(default)]
    pub vwap_distance: Option<f64>,
    /// Bid/ask spread in percent of mid, [0, 100].
    #[serde(default)]
    pub spread_pct: Option<f64>,
    /// BTC short-horizon trend, [-1, 1]. +1 is a strong pump.
    #[serde(default)]
    pub btc_microtrend: Option<f64>,
    /// Share of aggressive volume that was selling, [0, 1].
    #[serde(default)]
    pub aggressive_sell_ratio: Option<f64>,
}

impl FeatureSnapshot {
    /// An empty snapshot (every feature missing) for the given instrument.
    #[cfg(test)]
    pub fn empty(key: &SymbolKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            timestamp,
            price: None,
            ask_dominance: None,
            bid_weakness: None,
            sweep_score: None,
            oi_divergence: None,
            funding_rate: None,
            short_momentum: None,
            vwap_distance: None,
            spread_pct: None,
            btc_microtrend: None,
            aggressive_sell_ratio: None,
        }
    }

    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(&self.symbol, &self.exchange)
    }

    /// True when the snapshot's timestamp is more than `max_age` away from
    /// `now`, in either direction.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.timestamp).abs() > max_age
    }

    /// Return a copy with every invalid field set to `None`, plus the names
    /// of the fields that were neutralized.
    pub fn sanitized(&self) -> (Self, Vec<&'static str>) {
        let mut degraded = Vec::new();
        let mut out = self.clone();

        out.price = bounded(self.price, f64::MIN_POSITIVE, f64::MAX, "price", &mut degraded);
        out.ask_dominance = bounded(self.ask_dominance, 0.0, 1.0, "ask_dominance", &mut degraded);
        out.bid_weakness = bounded(self.bid_weakness, 0.0, 1.0, "bid_weakness", &mut degraded);
        out.sweep_score = bounded(self.sweep_score, 0.0, 1.0, "sweep_score", &mut degraded);
        out.oi_divergence = bounded(self.oi_divergence, -1.0, 1.0, "oi_divergence", &mut degraded);
        out.funding_rate = bounded(self.funding_rate, -0.05, 0.05, "funding_rate", &mut degraded);
        out.short_momentum =
            bounded(self.short_momentum, 0.0, 1.0, "short_momentum", &mut degraded);
        out.vwap_distance = bounded(self.vwap_distance, -0.2, 0.2, "vwap_distance", &mut degraded);
        out.spread_pct = bounded(self.spread_pct, 0.0, 100.0, "spread_pct", &mut degraded);
        out.btc_microtrend =
            bounded(self.btc_microtrend, -1.0, 1.0, "btc_microtrend", &mut degraded);
        out.aggressive_sell_ratio = bounded(
            self.aggressive_sell_ratio,
            0.0,
            1.0,
            "aggressive_sell_ratio",
            &mut degraded,
        );

        (out, degraded)
    }
}

/// Keep `value` only when it is finite and within `[lo, hi]`.
fn bounded(
    value: Option<f64>,
    lo: f64,
    hi: f64,
    name: &'static str,
    degraded: &mut Vec<&'static str>,
) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v >= lo && v <= hi => Some(v),
        Some(_) => {
            degraded.push(name);
            None
        }
        None => None,
    }
}
