// =============================================================================
// UPS Scorer: Weighted microstructure score for short setups (0-100)
// =============================================================================
//
// Each component is normalized to [0, 1] by a fixed transform where 0 is the
// neutral baseline (a missing or invalid feature also maps to 0), then
// weighted.  The weight table sums to 100, so the Unified Prediction Score is
// always in [0, 100].
//
//   oi_divergence        20   clamp(oi_divergence, 0, 1)
//   liquidity_pressure   20   mean(bid_weakness, clamp(vwap_distance / 1%, 0, 1))
//   orderflow_imbalance  15   clamp((ask_dominance - 0.5) / 0.5, 0, 1)
//   sweep                15   clamp(sweep_score, 0, 1)
//   btc_microtrend       10   clamp(-btc_microtrend, 0, 1)
//   short_momentum       10   clamp(short_momentum, 0, 1)
//   funding              10   clamp(funding_rate / 0.1%, 0, 1)
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::FeatureSnapshot;

/// VWAP extension that maps to full liquidity pressure (1 % above VWAP).
const VWAP_FULL_SCALE: f64 = 0.01;
/// Funding rate that maps to full funding pressure (0.1 % per interval).
const FUNDING_FULL_SCALE: f64 = 0.001;
/// Normalized component value above which a reason is reported.
const REASON_THRESHOLD: f64 = 0.5;

/// The scored components of the UPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreComponent {
    OiDivergence,
    LiquidityPressure,
    OrderflowImbalance,
    Sweep,
    BtcMicrotrend,
    ShortMomentum,
    Funding,
}

impl ScoreComponent {
    pub const ALL: [ScoreComponent; 7] = [
        Self::OiDivergence,
        Self::LiquidityPressure,
        Self::OrderflowImbalance,
        Self::Sweep,
        Self::BtcMicrotrend,
        Self::ShortMomentum,
        Self::Funding,
    ];

    fn reason(self) -> &'static str {
        match self {
            Self::OiDivergence => "Strong OI divergence (OI rising, price falling)",
            Self::LiquidityPressure => "High liquidity pressure (bid exhaustion, stretched above VWAP)",
            Self::OrderflowImbalance => "Ask-heavy orderbook (bearish imbalance)",
            Self::Sweep => "Large sell sweep detected",
            Self::BtcMicrotrend => "BTC microtrend favorable (drifting lower)",
            Self::ShortMomentum => "Negative price momentum",
            Self::Funding => "Positive funding rate (longs overleveraged)",
        }
    }
}

impl std::fmt::Display for ScoreComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OiDivergence => "oi_divergence",
            Self::LiquidityPressure => "liquidity_pressure",
            Self::OrderflowImbalance => "orderflow_imbalance",
            Self::Sweep => "sweep",
            Self::BtcMicrotrend => "btc_microtrend",
            Self::ShortMomentum => "short_momentum",
            Self::Funding => "funding",
        };
        write!(f, "{s}")
    }
}

/// Weight table. Weights are configuration constants, not computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub oi_divergence: f64,
    pub liquidity_pressure: f64,
    pub orderflow_imbalance: f64,
    pub sweep: f64,
    pub btc_microtrend: f64,
    pub short_momentum: f64,
    pub funding: f64,
}

impl ScoreWeights {
    pub fn get(&self, component: ScoreComponent) -> f64 {
        match component {
            ScoreComponent::OiDivergence => self.oi_divergence,
            ScoreComponent::LiquidityPressure => self.liquidity_pressure,
            ScoreComponent::OrderflowImbalance => self.orderflow_imbalance,
            ScoreComponent::Sweep => self.sweep,
            ScoreComponent::BtcMicrotrend => self.btc_microtrend,
            ScoreComponent::ShortMomentum => self.short_momentum,
            ScoreComponent::Funding => self.funding,
        }
    }

    #[cfg(test)]
    pub fn total(&self) -> f64 {
        ScoreComponent::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            oi_divergence: 20.0,
            liquidity_pressure: 20.0,
            orderflow_imbalance: 15.0,
            sweep: 15.0,
            btc_microtrend: 10.0,
            short_momentum: 10.0,
            funding: 10.0,
        }
    }
}

/// The contribution of a single component to the final score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreContribution {
    pub component: ScoreComponent,
    pub weight: f64,
    /// Normalized component value, [0, 1].
    pub normalized: f64,
    /// `weight * normalized`, in score points.
    pub contribution: f64,
}

/// Result of scoring one feature snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub symbol: String,
    pub exchange: String,
    /// Unified Prediction Score, [0, 100].
    pub value: f64,
    pub contributions: Vec<ScoreContribution>,
    pub reasons: Vec<String>,
    /// Features that were present but invalid and therefore neutralized.
    #[serde(default)]
    pub degraded_fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Pure scoring function over a fixed weight table.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoreWeights,
}

impl Scorer {
    /// Score a feature snapshot. Never fails: invalid inputs contribute 0.
    pub fn score(&self, features: &FeatureSnapshot) -> Score {
        let (clean, degraded) = features.sanitized();

        let mut contributions = Vec::with_capacity(ScoreComponent::ALL.len());
        let mut reasons = Vec::new();
        let mut total = 0.0;

        for component in ScoreComponent::ALL {
            let normalized = normalize(component, &clean);
            let weight = self.weights.get(component);
            let contribution = weight * normalized;
            total += contribution;

            if normalized > REASON_THRESHOLD {
                reasons.push(component.reason().to_string());
            }

            contributions.push(ScoreContribution {
                component,
                weight,
                normalized,
                contribution,
            });
        }

        if reasons.is_empty() {
            reasons.push("Weak signal - insufficient conviction".to_string());
        }

        Score {
            symbol: features.symbol.clone(),
            exchange: features.exchange.clone(),
            value: total.clamp(0.0, 100.0),
            contributions,
            reasons,
            degraded_fields: degraded.into_iter().map(String::from).collect(),
            timestamp: features.timestamp,
        }
    }
}

/// Map one component of a sanitized snapshot onto [0, 1].
fn normalize(component: ScoreComponent, f: &FeatureSnapshot) -> f64 {
    let unit = |v: f64| v.clamp(0.0, 1.0);

    match component {
        ScoreComponent::OiDivergence => f.oi_divergence.map(unit).unwrap_or(0.0),
        ScoreComponent::LiquidityPressure => {
            let parts: Vec<f64> = [
                f.bid_weakness.map(unit),
                f.vwap_distance.map(|d| unit(d / VWAP_FULL_SCALE)),
            ]
            .into_iter()
            .flatten()
            .collect();
            if parts.is_empty() {
                0.0
            } else {
                parts.iter().sum::<f64>() / parts.len() as f64
            }
        }
        ScoreComponent::OrderflowImbalance => f
            .ask_dominance
            .map(|a| unit((a - 0.5) / 0.5))
            .unwrap_or(0.0),
        ScoreComponent::Sweep => f.sweep_score.map(unit).unwrap_or(0.0),
        ScoreComponent::BtcMicrotrend => f.btc_microtrend.map(|b| unit(-b)).unwrap_or(0.0),
        ScoreComponent::ShortMomentum => f.short_momentum.map(unit).unwrap_or(0.0),
        ScoreComponent::Funding => f
            .funding_rate
            .map(|r| unit(r / FUNDING_FULL_SCALE))
            .unwrap_or(0.0),
    }
}
