// =============================================================================
// Feature Source: latest FeatureSnapshot per instrument
// =============================================================================
//
// Feature computation happens outside this process. Producers push snapshots
// into the `FeatureCache` (the REST ingest endpoint is one such producer) and
// the tick driver reads the newest snapshot per key through `FeatureSource`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{FeatureSnapshot, SymbolKey};

/// Read side used by the tick driver.
pub trait FeatureSource: Send + Sync {
    /// Newest snapshot for `key`, if any has arrived.
    fn latest(&self, key: &SymbolKey) -> Option<FeatureSnapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted,
    /// Older than (or as old as) the cached snapshot; dropped.
    Outdated,
    /// Empty symbol or exchange, or stamped too far in the future.
    Rejected,
}

/// A future-dated snapshot would shadow every real one that follows it, so
/// anything stamped more than `max_future_skew` ahead of the clock is refused.
#[derive(Debug)]
pub struct FeatureCache {
    latest: RwLock<HashMap<SymbolKey, FeatureSnapshot>>,
    max_future_skew: Duration,
}

impl FeatureCache {
    pub fn new(max_future_skew: Duration) -> Self {
        Self {
            latest: RwLock::new(HashMap::new()),
            max_future_skew,
        }
    }

    /// Store `snapshot` if it is newer than what is cached for its key.
    pub fn ingest(&self, snapshot: FeatureSnapshot) -> IngestOutcome {
        self.ingest_at(snapshot, Utc::now())
    }

    pub fn ingest_at(&self, snapshot: FeatureSnapshot, now: DateTime<Utc>) -> IngestOutcome {
        let key = snapshot.key();
        if key.symbol.is_empty() || key.exchange.is_empty() {
            warn!(symbol = %snapshot.symbol, exchange = %snapshot.exchange, "feature snapshot rejected: empty key");
            return IngestOutcome::Rejected;
        }
        if snapshot.timestamp.signed_duration_since(now) > self.max_future_skew {
            warn!(
                symbol = %key,
                timestamp = %snapshot.timestamp,
                now = %now,
                "feature snapshot rejected: timestamp in the future"
            );
            return IngestOutcome::Rejected;
        }

        let mut latest = self.latest.write();
        if let Some(existing) = latest.get(&key) {
            if snapshot.timestamp <= existing.timestamp {
                debug!(
                    symbol = %key,
                    incoming = %snapshot.timestamp,
                    cached = %existing.timestamp,
                    "outdated feature snapshot dropped"
                );
                return IngestOutcome::Outdated;
            }
        }

        latest.insert(key, snapshot);
        IngestOutcome::Accepted
    }

    pub fn len(&self) -> usize {
        self.latest.read().len()
    }
}

impl FeatureSource for FeatureCache {
    fn latest(&self, key: &SymbolKey) -> Option<FeatureSnapshot> {
        self.latest.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cache() -> FeatureCache {
        FeatureCache::new(Duration::seconds(5))
    }

    #[test]
    fn newest_snapshot_wins() {
        let cache = cache();
        let key = SymbolKey::new("ABCUSDT", "binance");
        let now = Utc::now();

        let mut newer = FeatureSnapshot::empty(&key, now);
        newer.price = Some(2.0);
        let mut older = FeatureSnapshot::empty(&key, now - Duration::seconds(5));
        older.price = Some(1.0);

        assert_eq!(cache.ingest(newer), IngestOutcome::Accepted);
        assert_eq!(cache.ingest(older), IngestOutcome::Outdated);
        assert_eq!(cache.latest(&key).unwrap().price, Some(2.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_are_normalized() {
        let cache = cache();
        let mut snap = FeatureSnapshot::empty(&SymbolKey::new("x", "y"), Utc::now());
        snap.symbol = "abcusdt".into();
        snap.exchange = "ByBit".into();
        cache.ingest(snap);
        assert!(cache.latest(&SymbolKey::new("ABCUSDT", "bybit")).is_some());
    }

    #[test]
    fn empty_symbol_rejected() {
        let cache = cache();
        let mut snap = FeatureSnapshot::empty(&SymbolKey::new("x", "y"), Utc::now());
        snap.symbol = "  ".into();
        assert_eq!(cache.ingest(snap), IngestOutcome::Rejected);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn future_dated_snapshot_cannot_shadow_live_feed() {
        let cache = cache();
        let key = SymbolKey::new("ABCUSDT", "binance");
        let now = Utc.with_ymd_and_hms(2026, 9, 14, 10, 0, 0).unwrap();

        let mut skewed = FeatureSnapshot::empty(&key, now + Duration::hours(1));
        skewed.price = Some(1.0);
        assert_eq!(cache.ingest_at(skewed, now), IngestOutcome::Rejected);
        assert!(cache.latest(&key).is_none());

        let mut slightly_ahead = FeatureSnapshot::empty(&key, now + Duration::seconds(3));
        slightly_ahead.price = Some(2.0);
        assert_eq!(cache.ingest_at(slightly_ahead, now), IngestOutcome::Accepted);

        let later = now + Duration::seconds(5);
        let mut live = FeatureSnapshot::empty(&key, later + Duration::seconds(1));
        live.price = Some(3.0);
        assert_eq!(cache.ingest_at(live, later), IngestOutcome::Accepted);
        assert_eq!(cache.latest(&key).unwrap().price, Some(3.0));
    }
}
