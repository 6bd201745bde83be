// =============================================================================
// Runtime Configuration: Engine thresholds, validated once at startup
// =============================================================================
//
// Every tunable threshold of the decision engine lives here.  The config is
// read from a JSON file, then selectively overridden from `SGNL_*` environment
// variables, then validated.  An invalid config is a fatal startup error: the
// engine refuses to run rather than trade on nonsense thresholds.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
//
// Percentages are expressed in percent units (1.7 means 1.7 %).
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::SymbolKey;

/// Longest hold a config may ask for: seven days.
pub const MAX_HOLD_SECONDS_LIMIT: u64 = 7 * 86_400;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "DOGEUSDT@binance".to_string(),
        "XRPUSDT@binance".to_string(),
        "ADAUSDT@bybit".to_string(),
        "TRXUSDT@mexc".to_string(),
    ]
}

fn default_score_min() -> f64 {
    72.0
}

fn default_min_ask_imbalance() -> f64 {
    0.60
}

fn default_min_sweep_score() -> f64 {
    0.50
}

fn default_min_oi_divergence() -> f64 {
    0.30
}

fn default_max_spread_pct() -> f64 {
    0.50
}

fn default_btc_pump_threshold() -> f64 {
    0.40
}

fn default_tp_pct() -> f64 {
    1.7
}

fn default_sl_pct() -> f64 {
    0.9
}

fn default_sl_pct_min() -> f64 {
    0.7
}

fn default_sl_pct_max() -> f64 {
    1.1
}

fn default_hard_stop_loss_pct() -> f64 {
    1.2
}

fn default_trail_activate_pct() -> f64 {
    0.6
}

fn default_trail_giveback_pct() -> f64 {
    0.4
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_dedup_window_seconds() -> u64 {
    900
}

fn default_max_daily_signals() -> u32 {
    8
}

fn default_tick_interval_seconds() -> u64 {
    5
}

fn default_max_hold_seconds() -> u64 {
    3600
}

fn default_emergency_btc_pump() -> f64 {
    0.80
}

fn default_liquidity_flip_imbalance() -> f64 {
    -0.30
}

fn default_buy_sweep_sell_ratio() -> f64 {
    0.30
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Universe -----------------------------------------------------------

    /// Instruments to evaluate, as `SYMBOL@exchange`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Entry gate ---------------------------------------------------------

    /// Minimum UPS (0-100) for an entry.
    #[serde(default = "default_score_min")]
    pub score_min: f64,

    /// Minimum ask dominance as a fraction (0.60 = 60 % of depth on the ask).
    #[serde(default = "default_min_ask_imbalance")]
    pub min_ask_imbalance: f64,

    /// Minimum sweep score, [0, 1].
    #[serde(default = "default_min_sweep_score")]
    pub min_sweep_score: f64,

    /// Minimum positive OI divergence, (0, 1].
    #[serde(default = "default_min_oi_divergence")]
    pub min_oi_divergence: f64,

    /// Spread ceiling in percent; entries require spread strictly below.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    /// BTC microtrend at or above this value counts as pumping.
    #[serde(default = "default_btc_pump_threshold")]
    pub btc_pump_threshold: f64,

    /// Instruments priced above this are not eligible for entries. `None`
    /// disables the filter. Exits are unaffected.
    #[serde(default)]
    pub max_entry_price: Option<f64>,

    // --- Signal prices ------------------------------------------------------

    /// Take-profit distance below entry, percent.
    #[serde(default = "default_tp_pct")]
    pub tp_pct: f64,

    /// Requested stop-loss distance above entry, percent. Clamped into
    /// `[sl_pct_min, sl_pct_max]`.
    #[serde(default = "default_sl_pct")]
    pub sl_pct: f64,

    #[serde(default = "default_sl_pct_min")]
    pub sl_pct_min: f64,

    #[serde(default = "default_sl_pct_max")]
    pub sl_pct_max: f64,

    // --- Exits --------------------------------------------------------------

    /// Unconditional loss exit, percent.
    #[serde(default = "default_hard_stop_loss_pct")]
    pub hard_stop_loss_pct: f64,

    /// Peak profit (percent) at which the trailing stop arms.
    #[serde(default = "default_trail_activate_pct")]
    pub trail_activate_pct: f64,

    /// Pullback from peak profit (percent) that fires the trailing stop.
    #[serde(default = "default_trail_giveback_pct")]
    pub trail_giveback_pct: f64,

    /// Maximum hold duration before a forced Timeout exit.
    #[serde(default = "default_max_hold_seconds")]
    pub max_hold_seconds: u64,

    /// BTC microtrend at or above this value forces an Emergency exit.
    #[serde(default = "default_emergency_btc_pump")]
    pub emergency_btc_pump: f64,

    /// Book imbalance (2 * ask_dominance - 1) at or below this value is a
    /// liquidity flip and forces an Emergency exit.
    #[serde(default = "default_liquidity_flip_imbalance")]
    pub liquidity_flip_imbalance: f64,

    /// A sweep with an aggressive sell ratio below this value is a buy sweep
    /// and forces an Emergency exit.
    #[serde(default = "default_buy_sweep_sell_ratio")]
    pub buy_sweep_sell_ratio: f64,

    // --- Rate limits --------------------------------------------------------

    /// Minimum seconds between two signals on the same symbol.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Lifetime of a registered dedup hash.
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,

    /// Global cap on signals per UTC calendar day.
    #[serde(default = "default_max_daily_signals")]
    pub max_daily_signals: u32,

    // --- Scheduling ---------------------------------------------------------

    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            score_min: default_score_min(),
            min_ask_imbalance: default_min_ask_imbalance(),
            min_sweep_score: default_min_sweep_score(),
            min_oi_divergence: default_min_oi_divergence(),
            max_spread_pct: default_max_spread_pct(),
            btc_pump_threshold: default_btc_pump_threshold(),
            max_entry_price: None,
            tp_pct: default_tp_pct(),
            sl_pct: default_sl_pct(),
            sl_pct_min: default_sl_pct_min(),
            sl_pct_max: default_sl_pct_max(),
            hard_stop_loss_pct: default_hard_stop_loss_pct(),
            trail_activate_pct: default_trail_activate_pct(),
            trail_giveback_pct: default_trail_giveback_pct(),
            max_hold_seconds: default_max_hold_seconds(),
            emergency_btc_pump: default_emergency_btc_pump(),
            liquidity_flip_imbalance: default_liquidity_flip_imbalance(),
            buy_sweep_sell_ratio: default_buy_sweep_sell_ratio(),
            cooldown_seconds: default_cooldown_seconds(),
            dedup_window_seconds: default_dedup_window_seconds(),
            max_daily_signals: default_max_daily_signals(),
            tick_interval_seconds: default_tick_interval_seconds(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Apply `SGNL_*` overrides from an environment lookup. Unparseable
    /// values are errors, not silently ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(syms) = lookup("SGNL_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        macro_rules! override_field {
            ($var:literal, $field:ident) => {
                if let Some(raw) = lookup($var) {
                    self.$field = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid value for {}: '{}'", $var, raw))?;
                }
            };
        }

        override_field!("SGNL_SCORE_MIN", score_min);
        override_field!("SGNL_MIN_ASK_IMBALANCE", min_ask_imbalance);
        override_field!("SGNL_TP_PCT", tp_pct);
        override_field!("SGNL_SL_PCT", sl_pct);
        override_field!("SGNL_HARD_STOP_LOSS_PCT", hard_stop_loss_pct);
        override_field!("SGNL_TRAIL_ACTIVATE_PCT", trail_activate_pct);
        override_field!("SGNL_TRAIL_GIVEBACK_PCT", trail_giveback_pct);
        override_field!("SGNL_COOLDOWN_SECONDS", cooldown_seconds);
        override_field!("SGNL_DEDUP_WINDOW_SECONDS", dedup_window_seconds);
        override_field!("SGNL_MAX_DAILY_SIGNALS", max_daily_signals);
        override_field!("SGNL_TICK_INTERVAL_SECONDS", tick_interval_seconds);
        override_field!("SGNL_MAX_HOLD_SECONDS", max_hold_seconds);

        if let Some(raw) = lookup("SGNL_MAX_ENTRY_PRICE") {
            let raw = raw.trim();
            self.max_entry_price = if raw.is_empty() || raw.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(
                    raw.parse()
                        .with_context(|| format!("invalid value for SGNL_MAX_ENTRY_PRICE: '{raw}'"))?,
                )
            };
        }

        Ok(())
    }

    /// Check every threshold against sane bounds. All violations are
    /// reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        let mut check = |ok: bool, msg: String| {
            if !ok {
                problems.push(msg);
            }
        };

        let finite_in = |v: f64, lo: f64, hi: f64| v.is_finite() && v >= lo && v <= hi;

        check(!self.symbols.is_empty(), "symbols must not be empty".into());
        for raw in &self.symbols {
            check(
                SymbolKey::parse(raw).is_some(),
                format!("symbol '{raw}' is not SYMBOL or SYMBOL@exchange"),
            );
        }

        check(
            finite_in(self.score_min, 0.0, 100.0),
            format!("score_min {} outside [0, 100]", self.score_min),
        );
        check(
            finite_in(self.min_ask_imbalance, 0.5, 1.0),
            format!("min_ask_imbalance {} outside [0.5, 1]", self.min_ask_imbalance),
        );
        check(
            finite_in(self.min_sweep_score, 0.0, 1.0),
            format!("min_sweep_score {} outside [0, 1]", self.min_sweep_score),
        );
        check(
            finite_in(self.min_oi_divergence, 0.0, 1.0),
            format!("min_oi_divergence {} outside [0, 1]", self.min_oi_divergence),
        );
        check(
            finite_in(self.max_spread_pct, 0.0, 5.0) && self.max_spread_pct > 0.0,
            format!("max_spread_pct {} outside (0, 5]", self.max_spread_pct),
        );
        check(
            finite_in(self.btc_pump_threshold, -1.0, 1.0),
            format!("btc_pump_threshold {} outside [-1, 1]", self.btc_pump_threshold),
        );
        if let Some(cap) = self.max_entry_price {
            check(
                cap.is_finite() && cap > 0.0,
                format!("max_entry_price {cap} must be a positive price"),
            );
        }

        check(
            finite_in(self.tp_pct, 0.0, 20.0) && self.tp_pct > 0.0,
            format!("tp_pct {} outside (0, 20]", self.tp_pct),
        );
        check(
            finite_in(self.sl_pct, 0.0, 20.0) && self.sl_pct > 0.0,
            format!("sl_pct {} outside (0, 20]", self.sl_pct),
        );
        check(
            finite_in(self.sl_pct_min, 0.0, 20.0) && self.sl_pct_min > 0.0,
            format!("sl_pct_min {} outside (0, 20]", self.sl_pct_min),
        );
        check(
            finite_in(self.sl_pct_max, 0.0, 20.0) && self.sl_pct_max >= self.sl_pct_min,
            format!(
                "sl_pct_max {} must be within 20 and >= sl_pct_min {}",
                self.sl_pct_max, self.sl_pct_min
            ),
        );

        check(
            finite_in(self.hard_stop_loss_pct, 0.0, 20.0) && self.hard_stop_loss_pct > 0.0,
            format!("hard_stop_loss_pct {} outside (0, 20]", self.hard_stop_loss_pct),
        );
        check(
            finite_in(self.trail_activate_pct, 0.0, 20.0) && self.trail_activate_pct > 0.0,
            format!("trail_activate_pct {} outside (0, 20]", self.trail_activate_pct),
        );
        check(
            finite_in(self.trail_giveback_pct, 0.0, 20.0) && self.trail_giveback_pct > 0.0,
            format!("trail_giveback_pct {} outside (0, 20]", self.trail_giveback_pct),
        );
        check(
            finite_in(self.emergency_btc_pump, -1.0, 1.0),
            format!("emergency_btc_pump {} outside [-1, 1]", self.emergency_btc_pump),
        );
        check(
            finite_in(self.liquidity_flip_imbalance, -1.0, 0.0),
            format!(
                "liquidity_flip_imbalance {} outside [-1, 0]",
                self.liquidity_flip_imbalance
            ),
        );
        check(
            finite_in(self.buy_sweep_sell_ratio, 0.0, 1.0),
            format!("buy_sweep_sell_ratio {} outside [0, 1]", self.buy_sweep_sell_ratio),
        );

        check(
            self.cooldown_seconds <= 86_400,
            format!("cooldown_seconds {} exceeds one day", self.cooldown_seconds),
        );
        check(
            self.dedup_window_seconds > 0 && self.dedup_window_seconds <= 86_400,
            format!("dedup_window_seconds {} outside (0, 86400]", self.dedup_window_seconds),
        );
        check(
            self.max_daily_signals >= 1 && self.max_daily_signals <= 1_000,
            format!("max_daily_signals {} outside [1, 1000]", self.max_daily_signals),
        );
        check(
            self.tick_interval_seconds >= 1 && self.tick_interval_seconds <= 3_600,
            format!(
                "tick_interval_seconds {} outside [1, 3600]",
                self.tick_interval_seconds
            ),
        );
        check(
            self.max_hold_seconds <= MAX_HOLD_SECONDS_LIMIT,
            format!(
                "max_hold_seconds {} exceeds {MAX_HOLD_SECONDS_LIMIT}",
                self.max_hold_seconds
            ),
        );
        check(
            self.max_hold_seconds > self.tick_interval_seconds,
            format!(
                "max_hold_seconds {} must exceed tick_interval_seconds {}",
                self.max_hold_seconds, self.tick_interval_seconds
            ),
        );

        if !problems.is_empty() {
            bail!("invalid engine config: {}", problems.join("; "));
        }
        Ok(())
    }

    /// Parsed symbol keys. Invalid entries are dropped (they are rejected by
    /// [`validate`](Self::validate) before the engine starts).
    pub fn symbol_keys(&self) -> Vec<SymbolKey> {
        let mut keys: Vec<SymbolKey> = self
            .symbols
            .iter()
            .filter_map(|s| SymbolKey::parse(s))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Stop-loss distance actually used for signals.
    pub fn effective_sl_pct(&self) -> f64 {
        self.sl_pct.clamp(self.sl_pct_min, self.sl_pct_max)
    }

    pub fn tick_interval(&self) -> Duration {
        seconds(self.tick_interval_seconds)
    }

    /// Snapshots older than two tick intervals are skipped.
    pub fn staleness_limit(&self) -> Duration {
        self.tick_interval().checked_mul(2).unwrap_or(Duration::MAX)
    }

    pub fn cooldown(&self) -> Duration {
        seconds(self.cooldown_seconds)
    }

    pub fn dedup_window(&self) -> Duration {
        seconds(self.dedup_window_seconds)
    }

    pub fn max_hold(&self) -> Duration {
        seconds(self.max_hold_seconds)
    }
}

/// Seconds as a chrono duration, saturating instead of wrapping or panicking.
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!((cfg.score_min - 72.0).abs() < f64::EPSILON);
        assert!((cfg.min_ask_imbalance - 0.60).abs() < f64::EPSILON);
        assert!((cfg.tp_pct - 1.7).abs() < f64::EPSILON);
        assert!((cfg.hard_stop_loss_pct - 1.2).abs() < f64::EPSILON);
        assert!((cfg.trail_activate_pct - 0.6).abs() < f64::EPSILON);
        assert!((cfg.trail_giveback_pct - 0.4).abs() < f64::EPSILON);
        assert_eq!(cfg.dedup_window_seconds, 900);
        assert_eq!(cfg.max_daily_signals, 8);
        assert_eq!(cfg.tick_interval_seconds, 5);
        assert_eq!(cfg.max_hold_seconds, 3600);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.cooldown_seconds, 300);
        assert_eq!(cfg.symbols.len(), 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "score_min": 80, "symbols": ["ETHUSDT@bybit"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.score_min - 80.0).abs() < f64::EPSILON);
        assert_eq!(cfg.symbol_keys(), vec![SymbolKey::new("ETHUSDT", "bybit")]);
        assert_eq!(cfg.max_daily_signals, 8);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut cfg = EngineConfig::default();
        cfg.score_min = 140.0;
        cfg.sl_pct_min = 1.5;
        cfg.sl_pct_max = 1.0;
        cfg.max_daily_signals = 0;
        cfg.symbols.clear();

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("score_min"), "{err}");
        assert!(err.contains("sl_pct_max"), "{err}");
        assert!(err.contains("max_daily_signals"), "{err}");
        assert!(err.contains("symbols"), "{err}");
    }

    #[test]
    fn validate_rejects_nan_thresholds() {
        let mut cfg = EngineConfig::default();
        cfg.tp_pct = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hold_must_exceed_tick() {
        let mut cfg = EngineConfig::default();
        cfg.max_hold_seconds = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_hold_fails_validation_without_panicking() {
        for secs in [u64::MAX, 10_000_000_000_000_000] {
            let mut cfg = EngineConfig::default();
            cfg.max_hold_seconds = secs;
            let err = cfg.validate().unwrap_err().to_string();
            assert!(err.contains("max_hold_seconds"), "{err}");
            assert!(cfg.max_hold() > Duration::days(7));
        }

        let mut cfg = EngineConfig::default();
        cfg.max_hold_seconds = MAX_HOLD_SECONDS_LIMIT;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_hold(), Duration::days(7));
    }

    #[test]
    fn max_entry_price_is_optional_and_checked() {
        let cfg: EngineConfig = serde_json::from_str(r#"{ "max_entry_price": 5.0 }"#).unwrap();
        assert_eq!(cfg.max_entry_price, Some(5.0));
        assert!(cfg.validate().is_ok());

        let mut cfg = EngineConfig::default();
        cfg.max_entry_price = Some(-1.0);
        assert!(cfg.validate().is_err());

        cfg.apply_env_overrides(|k| (k == "SGNL_MAX_ENTRY_PRICE").then(|| "off".to_string()))
            .unwrap();
        assert_eq!(cfg.max_entry_price, None);
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let env: HashMap<&str, &str> = [
            ("SGNL_SCORE_MIN", "65.5"),
            ("SGNL_MAX_DAILY_SIGNALS", "3"),
            ("SGNL_SYMBOLS", "aaausdt@mexc, bbbusdt"),
        ]
        .into_iter()
        .collect();

        let mut cfg = EngineConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!((cfg.score_min - 65.5).abs() < f64::EPSILON);
        assert_eq!(cfg.max_daily_signals, 3);
        assert_eq!(
            cfg.symbol_keys(),
            vec![
                SymbolKey::new("AAAUSDT", "mexc"),
                SymbolKey::new("BBBUSDT", "binance"),
            ]
        );

        let mut cfg = EngineConfig::default();
        let res = cfg.apply_env_overrides(|k| {
            (k == "SGNL_COOLDOWN_SECONDS").then(|| "soon".to_string())
        });
        assert!(res.is_err());
    }

    #[test]
    fn effective_sl_is_clamped() {
        let mut cfg = EngineConfig::default();
        cfg.sl_pct = 3.0;
        assert!((cfg.effective_sl_pct() - 1.1).abs() < f64::EPSILON);
        cfg.sl_pct = 0.1;
        assert!((cfg.effective_sl_pct() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn staleness_limit_is_two_ticks() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.staleness_limit(), Duration::seconds(10));
    }
}
