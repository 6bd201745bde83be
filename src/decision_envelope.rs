// =============================================================================
// Gate Decision: auditable record of every entry evaluation
// =============================================================================
//
// One record per symbol per tick in which the entry gate ran. Kept in a ring
// buffer on AppState and served by the dashboard API, so that "why did this
// not fire?" is answerable after the fact.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entry_gate::{GateCondition, Verdict};
use crate::signals::{Score, Suppression};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionOutcome {
    Emit,
    Block,
    Suppress,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub score: f64,
    pub outcome: DecisionOutcome,

    /// Conditions that failed (only for `Block`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_conditions: Vec<GateCondition>,

    /// Ledger refusal (only for `Suppress`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression: Option<Suppression>,

    /// Id of the emitted signal (only for `Emit`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl GateDecision {
    pub fn from_verdict(verdict: &Verdict, score: &Score, now: DateTime<Utc>) -> Self {
        let mut decision = Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: score.symbol.clone(),
            exchange: score.exchange.clone(),
            score: score.value,
            outcome: DecisionOutcome::Block,
            failed_conditions: Vec::new(),
            suppression: None,
            signal_id: None,
            created_at: now,
        };

        match verdict {
            Verdict::Emit(signal) => {
                decision.outcome = DecisionOutcome::Emit;
                decision.signal_id = Some(signal.id.clone());
            }
            Verdict::Blocked(conditions) => {
                decision.failed_conditions = conditions.clone();
            }
            Verdict::Suppressed(reason) => {
                decision.outcome = DecisionOutcome::Suppress;
                decision.suppression = Some(*reason);
            }
        }

        decision
    }
}
