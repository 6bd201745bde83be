// =============================================================================
// Exit Management Module
// =============================================================================
//
// Ordered exit rules for open shorts. The tick driver runs them once per
// symbol per tick, right after the position book absorbs the latest price.

pub mod rules;

pub use rules::{ExitDecision, ExitEvaluator, ExitReason, MarketContext};
