// =============================================================================
// Signal deduplication: coarse content hash + expiring registry
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Width of a score bucket in UPS points.
const SCORE_BUCKET: f64 = 5.0;
/// Significant digits kept from the entry price.
const PRICE_SIG_DIGITS: usize = 4;

/// Stable dedup key for a signal: symbol, entry price rounded to
/// [`PRICE_SIG_DIGITS`] significant digits, and the score floored to a
/// [`SCORE_BUCKET`]-point bucket. Two signals that only differ by noise below
/// those resolutions share a hash.
pub fn dedup_hash(symbol: &str, entry_price: f64, score: f64) -> String {
    let price_bucket = format!("{:.*e}", PRICE_SIG_DIGITS - 1, entry_price);
    let score_bucket = ((score / SCORE_BUCKET).floor() * SCORE_BUCKET) as i64;
    let material = format!("{}|{}|{}", symbol.to_uppercase(), price_bucket, score_bucket);

    let digest = Sha256::digest(material.as_bytes());
    hex::encode(&digest[..16])
}

/// Registry of recently emitted hashes, each with an expiry.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    entries: HashMap<String, DateTime<Utc>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `hash` was registered and its window has not yet expired.
    pub fn is_active(&self, hash: &str, now: DateTime<Utc>) -> bool {
        self.entries.get(hash).is_some_and(|expiry| now < *expiry)
    }

    pub fn register(&mut self, hash: &str, now: DateTime<Utc>, window: Duration) {
        self.entries.insert(hash.to_string(), now + window);
    }

    /// Drop expired entries. Returns the number removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| now < *expiry);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let a = dedup_hash("abcusdt", 1.23456, 77.3);
        let b = dedup_hash("ABCUSDT", 1.23456, 77.3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn noise_below_resolution_shares_a_hash() {
        assert_eq!(dedup_hash("X", 1.23451, 76.0), dedup_hash("X", 1.23460, 79.9));
    }

    #[test]
    fn material_differences_change_the_hash() {
        let base = dedup_hash("X", 1.2345, 76.0);
        assert_ne!(base, dedup_hash("Y", 1.2345, 76.0));
        assert_ne!(base, dedup_hash("X", 1.2400, 76.0));
        assert_ne!(base, dedup_hash("X", 1.2345, 81.0));
    }

    #[test]
    fn registry_expires_entries() {
        let now = Utc::now();
        let mut reg = DedupRegistry::new();
        reg.register("h", now, Duration::seconds(900));

        assert!(reg.is_active("h", now + Duration::seconds(899)));
        assert!(!reg.is_active("h", now + Duration::seconds(900)));
        assert!(!reg.is_active("other", now));

        assert_eq!(reg.purge_expired(now + Duration::seconds(901)), 1);
        assert_eq!(reg.len(), 0);
    }
}
