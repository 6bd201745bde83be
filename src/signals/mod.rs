// =============================================================================
// Signals Module
// =============================================================================
//
// Everything between a feature snapshot and an admitted short signal:
// - UPS scoring of microstructure features
// - Content hashing for signal deduplication
// - The ledger that enforces dedup, per-symbol cooldown and the daily cap

pub mod dedup;
pub mod ledger;
pub mod scorer;

pub use dedup::dedup_hash;
pub use ledger::{LedgerSnapshot, SignalLedger, Suppression};
pub use scorer::{Score, Scorer};
