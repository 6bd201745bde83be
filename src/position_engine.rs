// =============================================================================
// Position Engine: notional short positions, one per symbol
// =============================================================================
//
// Life-cycle:
//   Flat  ->  Open    (on an emitted Signal)
//   Open  ->  Closed  (on an ExitDecision; moved to the closed journal)
//
// While Open, every price update maintains:
//   - best_low            lowest price seen, never increases
//   - peak_profit_pct     (entry - best_low) / entry * 100
//   - trailing_active     latches once peak profit reaches trail_activate_pct
//
// All profit figures are for a SHORT: profit is positive when price falls.
//
// Thread-safety: the open map and the closed journal are each behind a
// `parking_lot::RwLock`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry_gate::Signal;
use crate::exit::{ExitDecision, ExitReason};
use crate::types::{SymbolKey, PCT_EPSILON};

/// Closed positions retained for the journal.
const MAX_CLOSED_JOURNAL: usize = 500;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A notional short position opened from a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub signal_id: String,
    pub symbol: String,
    pub exchange: String,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub last_price: f64,
    /// Lowest price observed since open.
    pub best_low: f64,
    pub unrealized_profit_pct: f64,
    pub peak_profit_pct: f64,
    pub trailing_active: bool,
    pub status: PositionStatus,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl_pct: Option<f64>,
}

impl Position {
    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(&self.symbol, &self.exchange)
    }

    /// Short-side profit at `price`, in percent of entry.
    pub fn profit_pct_at(&self, price: f64) -> f64 {
        (self.entry_price - price) / self.entry_price * 100.0
    }
}

/// Emitted when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub position_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub exchange: String,
    pub exit_reason: ExitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_detail: Option<String>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl_pct: f64,
    pub peak_profit_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// The symbol already has an Open position; the existing one is kept.
    AlreadyOpen { existing_id: String },
    InvalidEntryPrice,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyOpen { existing_id } => {
                write!(f, "position already open (id {existing_id})")
            }
            Self::InvalidEntryPrice => write!(f, "entry price must be positive and finite"),
        }
    }
}

impl std::error::Error for OpenError {}

/// Aggregate figures over the closed journal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalStats {
    pub total_closed: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
    pub total_pnl_pct: f64,
    pub best_pnl_pct: f64,
    pub worst_pnl_pct: f64,
    /// Gross profit over gross loss; `None` while there are no losses.
    pub profit_factor: Option<f64>,
    pub avg_duration_secs: f64,
    pub by_exit_reason: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// PositionBook
// ---------------------------------------------------------------------------

/// Owns every Open position (keyed by symbol) and the closed journal.
pub struct PositionBook {
    open: RwLock<HashMap<SymbolKey, Position>>,
    closed: RwLock<VecDeque<Position>>,
    trail_activate_pct: f64,
}

impl PositionBook {
    pub fn new(trail_activate_pct: f64) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(VecDeque::new()),
            trail_activate_pct,
        }
    }

    /// Open a short from `signal`. Returns the new position id.
    pub fn open(&self, signal: &Signal, now: DateTime<Utc>) -> Result<String, OpenError> {
        if !(signal.entry_price.is_finite() && signal.entry_price > 0.0) {
            return Err(OpenError::InvalidEntryPrice);
        }

        let key = SymbolKey::new(&signal.symbol, &signal.exchange);
        let mut open = self.open.write();

        if let Some(existing) = open.get(&key) {
            warn!(
                symbol = %key,
                existing_id = %existing.id,
                signal_id = %signal.id,
                "open ignored: position already open"
            );
            return Err(OpenError::AlreadyOpen {
                existing_id: existing.id.clone(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let pos = Position {
            id: id.clone(),
            signal_id: signal.id.clone(),
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            entry_price: signal.entry_price,
            opened_at: now,
            last_price: signal.entry_price,
            best_low: signal.entry_price,
            unrealized_profit_pct: 0.0,
            peak_profit_pct: 0.0,
            trailing_active: false,
            status: PositionStatus::Open,
            closed_at: None,
            exit_reason: None,
            exit_price: None,
            realized_pnl_pct: None,
        };

        info!(
            id = %id,
            symbol = %key,
            entry_price = signal.entry_price,
            signal_id = %signal.id,
            "position opened"
        );

        open.insert(key, pos);
        Ok(id)
    }

    /// Apply a price observation to the symbol's Open position. Returns the
    /// updated position, or `None` if the symbol is Flat or the price is
    /// unusable.
    pub fn update(&self, key: &SymbolKey, price: f64) -> Option<Position> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }

        let mut open = self.open.write();
        let pos = open.get_mut(key)?;

        pos.last_price = price;
        pos.unrealized_profit_pct = pos.profit_pct_at(price);

        if price < pos.best_low {
            pos.best_low = price;
            pos.peak_profit_pct = pos.profit_pct_at(price);
        }

        if !pos.trailing_active && pos.peak_profit_pct + PCT_EPSILON >= self.trail_activate_pct {
            pos.trailing_active = true;
            debug!(
                id = %pos.id,
                symbol = %key,
                peak_profit_pct = pos.peak_profit_pct,
                "trailing stop armed"
            );
        }

        Some(pos.clone())
    }

    /// Close the symbol's Open position and move it to the journal.
    pub fn close(
        &self,
        key: &SymbolKey,
        decision: &ExitDecision,
        now: DateTime<Utc>,
    ) -> Option<PositionClosed> {
        let mut pos = self.open.write().remove(key)?;

        let realized = pos.profit_pct_at(decision.exit_price);
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(now);
        pos.exit_reason = Some(decision.reason);
        pos.exit_price = Some(decision.exit_price);
        pos.realized_pnl_pct = Some(realized);
        pos.last_price = decision.exit_price;
        pos.unrealized_profit_pct = 0.0;

        let event = PositionClosed {
            position_id: pos.id.clone(),
            signal_id: pos.signal_id.clone(),
            symbol: pos.symbol.clone(),
            exchange: pos.exchange.clone(),
            exit_reason: decision.reason,
            exit_detail: decision.detail.clone(),
            entry_price: pos.entry_price,
            exit_price: decision.exit_price,
            realized_pnl_pct: realized,
            peak_profit_pct: pos.peak_profit_pct,
            opened_at: pos.opened_at,
            closed_at: now,
            duration_secs: now.signed_duration_since(pos.opened_at).num_seconds(),
        };

        info!(
            id = %pos.id,
            symbol = %key,
            reason = %decision.reason,
            exit_price = decision.exit_price,
            realized_pnl_pct = realized,
            "position closed"
        );

        self.journal(pos);
        Some(event)
    }

    /// Put a position closed before a restart back into the journal.
    pub fn restore_closed(&self, event: &PositionClosed) {
        let best_low = event.entry_price * (1.0 - event.peak_profit_pct / 100.0);
        self.journal(Position {
            id: event.position_id.clone(),
            signal_id: event.signal_id.clone(),
            symbol: event.symbol.clone(),
            exchange: event.exchange.clone(),
            entry_price: event.entry_price,
            opened_at: event.opened_at,
            last_price: event.exit_price,
            best_low,
            unrealized_profit_pct: 0.0,
            peak_profit_pct: event.peak_profit_pct,
            trailing_active: event.peak_profit_pct + PCT_EPSILON >= self.trail_activate_pct,
            status: PositionStatus::Closed,
            closed_at: Some(event.closed_at),
            exit_reason: Some(event.exit_reason),
            exit_price: Some(event.exit_price),
            realized_pnl_pct: Some(event.realized_pnl_pct),
        });
    }

    fn journal(&self, pos: Position) {
        let mut closed = self.closed.write();
        closed.push_back(pos);
        while closed.len() > MAX_CLOSED_JOURNAL {
            closed.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn has_open(&self, key: &SymbolKey) -> bool {
        self.open.read().contains_key(key)
    }

    pub fn get_open(&self, key: &SymbolKey) -> Option<Position> {
        self.open.read().get(key).cloned()
    }

    /// All Open positions, sorted by symbol key.
    pub fn open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.open.read().values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// The most recent `count` closed positions (newest first).
    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        self.closed.read().iter().rev().take(count).cloned().collect()
    }

    pub fn journal_stats(&self) -> JournalStats {
        let closed = self.closed.read();
        let pnls: Vec<f64> = closed.iter().filter_map(|p| p.realized_pnl_pct).collect();
        if pnls.is_empty() {
            return JournalStats::default();
        }

        let total = pnls.len();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        let total_pnl: f64 = pnls.iter().sum();
        let durations: Vec<f64> = closed
            .iter()
            .filter_map(|p| p.closed_at.map(|c| c.signed_duration_since(p.opened_at)))
            .map(|d| d.num_seconds() as f64)
            .collect();

        let gross_profit: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();

        let mut by_exit_reason = HashMap::new();
        for reason in closed.iter().filter_map(|p| p.exit_reason) {
            *by_exit_reason.entry(reason.to_string()).or_insert(0) += 1;
        }

        JournalStats {
            total_closed: total,
            wins,
            losses: total - wins,
            win_rate: wins as f64 / total as f64 * 100.0,
            avg_pnl_pct: total_pnl / total as f64,
            total_pnl_pct: total_pnl,
            best_pnl_pct: pnls.iter().copied().fold(f64::MIN, f64::max),
            worst_pnl_pct: pnls.iter().copied().fold(f64::MAX, f64::min),
            profit_factor: (gross_loss > 0.0).then(|| gross_profit / gross_loss),
            avg_duration_secs: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            },
            by_exit_reason,
        }
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}
