//! In-memory cache layer: signature and consensus LRUs.
//!
//! Caches hold strictly derived state. Clearing them must never change the
//! answer of any query, only its cost; the engine enforces this by always
//! falling through to the store and re-deriving on miss.

use crate::types::GpsPoint;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Signature cache capacity (simplified polylines, one per activity).
pub const SIGNATURE_CACHE_CAP: usize = 200;

/// Consensus cache capacity (one polyline per route group).
pub const CONSENSUS_CACHE_CAP: usize = 50;

/// LRU caches for derived polylines.
pub struct CacheLayer {
    signatures: LruCache<String, Vec<GpsPoint>>,
    consensus: LruCache<String, Vec<GpsPoint>>,
}

impl CacheLayer {
    pub fn new() -> Self {
        Self {
            signatures: LruCache::new(NonZeroUsize::new(SIGNATURE_CACHE_CAP).unwrap()),
            consensus: LruCache::new(NonZeroUsize::new(CONSENSUS_CACHE_CAP).unwrap()),
        }
    }

    pub fn get_signature(&mut self, activity_id: &str) -> Option<Vec<GpsPoint>> {
        self.signatures.get(activity_id).cloned()
    }

    pub fn put_signature(&mut self, activity_id: String, signature: Vec<GpsPoint>) {
        self.signatures.put(activity_id, signature);
    }

    pub fn evict_signature(&mut self, activity_id: &str) {
        self.signatures.pop(activity_id);
    }

    pub fn get_consensus(&mut self, group_id: &str) -> Option<Vec<GpsPoint>> {
        self.consensus.get(group_id).cloned()
    }

    pub fn put_consensus(&mut self, group_id: String, polyline: Vec<GpsPoint>) {
        self.consensus.put(group_id, polyline);
    }

    /// Consensus polylines depend on group membership; any change to groups
    /// invalidates all of them.
    pub fn clear_consensus(&mut self) {
        self.consensus.clear();
    }

    pub fn clear(&mut self) {
        self.signatures.clear();
        self.consensus.clear();
    }

    pub fn signature_len(&self) -> usize {
        self.signatures.len()
    }

    pub fn consensus_len(&self) -> usize {
        self.consensus.len()
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly(n: usize) -> Vec<GpsPoint> {
        (0..n).map(|i| GpsPoint::new(i as f64, 0.0)).collect()
    }

    #[test]
    fn test_signature_round_trip() {
        let mut cache = CacheLayer::new();
        cache.put_signature("a".into(), poly(3));
        assert_eq!(cache.get_signature("a").unwrap().len(), 3);
        assert!(cache.get_signature("b").is_none());
    }

    #[test]
    fn test_signature_cap_evicts_lru() {
        let mut cache = CacheLayer::new();
        for i in 0..SIGNATURE_CACHE_CAP + 10 {
            cache.put_signature(format!("act-{i}"), poly(2));
        }
        assert_eq!(cache.signature_len(), SIGNATURE_CACHE_CAP);
        // The oldest entries were evicted.
        assert!(cache.get_signature("act-0").is_none());
        assert!(cache
            .get_signature(&format!("act-{}", SIGNATURE_CACHE_CAP + 9))
            .is_some());
    }

    #[test]
    fn test_clear_consensus_keeps_signatures() {
        let mut cache = CacheLayer::new();
        cache.put_signature("a".into(), poly(2));
        cache.put_consensus("g".into(), poly(2));
        cache.clear_consensus();
        assert_eq!(cache.consensus_len(), 0);
        assert_eq!(cache.signature_len(), 1);
    }
}
