//! Duplicate-packet detection (§4.6 step 1, §3 "seen-cache").
//!
//! Keyed by a fingerprint of `(sender_id, timestamp, first N bytes of
//! payload)` rather than the full payload so the cache cost is bounded
//! regardless of message size. Bounded to [`DEFAULT_CAPACITY`] entries,
//! evicting oldest-first, with an independent time-based expiry so a
//! long-idle mesh doesn't serve stale dedup state forever (§3, §8 Relay).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::protocol::PeerId;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Bytes of payload folded into the dedup key; enough to disambiguate
/// distinct messages without hashing arbitrarily large payloads.
const PAYLOAD_PREFIX_LEN: usize = 64;

pub type SeenKey = [u8; 32];

pub fn seen_key(sender_id: &PeerId, timestamp: u64, payload: &[u8]) -> SeenKey {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(&payload[..payload.len().min(PAYLOAD_PREFIX_LEN)]);
    hasher.finalize().into()
}

struct Entry {
    key: SeenKey,
    inserted_at: Instant,
}

/// Bounded, time-expiring set of recently seen packet fingerprints.
///
/// Not thread-safe on its own; callers that share this across tasks wrap it
/// in a mutex alongside the rest of the relay state (see lock-ordering
/// notes on [`crate::mesh::router`]).
pub struct SeenCache {
    capacity: usize,
    expiry: Duration,
    index: HashMap<SeenKey, ()>,
    order: VecDeque<Entry>,
}

impl SeenCache {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        Self {
            capacity,
            expiry,
            index: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `key` as seen and report whether it had already been seen.
    /// Returns `true` if this is a duplicate (the packet should be
    /// dropped), `false` if this is the first sighting (continue relay
    /// processing).
    pub fn check_and_insert(&mut self, key: SeenKey) -> bool {
        self.expire_old();
        if self.index.contains_key(&key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.index.remove(&evicted.key);
            }
        }
        self.index.insert(key, ());
        self.order.push_back(Entry {
            key,
            inserted_at: Instant::now(),
        });
        false
    }

    fn expire_old(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.order.front() {
            if now.duration_since(front.inserted_at) > self.expiry {
                let evicted = self.order.pop_front().unwrap();
                self.index.remove(&evicted.key);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_a_duplicate_second_is() {
        let mut cache = SeenCache::new(DEFAULT_CAPACITY, DEFAULT_EXPIRY);
        let key = seen_key(&PeerId::new([1; 8]), 1000, b"hello");
        assert!(!cache.check_and_insert(key));
        assert!(cache.check_and_insert(key));
    }

    #[test]
    fn distinct_payloads_are_distinct_entries() {
        let mut cache = SeenCache::new(DEFAULT_CAPACITY, DEFAULT_EXPIRY);
        let a = seen_key(&PeerId::new([1; 8]), 1000, b"hello");
        let b = seen_key(&PeerId::new([1; 8]), 1000, b"world");
        assert!(!cache.check_and_insert(a));
        assert!(!cache.check_and_insert(b));
    }

    #[test]
    fn capacity_evicts_oldest_entry_first() {
        let mut cache = SeenCache::new(2, DEFAULT_EXPIRY);
        let a = seen_key(&PeerId::new([1; 8]), 1, b"a");
        let b = seen_key(&PeerId::new([1; 8]), 2, b"b");
        let c = seen_key(&PeerId::new([1; 8]), 3, b"c");
        cache.check_and_insert(a);
        cache.check_and_insert(b);
        cache.check_and_insert(c);
        assert_eq!(cache.len(), 2);
        // `a` was evicted, so it now looks unseen again.
        assert!(!cache.check_and_insert(a));
    }

    #[test]
    fn expired_entries_are_treated_as_unseen() {
        let mut cache = SeenCache::new(DEFAULT_CAPACITY, Duration::from_millis(1));
        let key = seen_key(&PeerId::new([1; 8]), 1, b"a");
        cache.check_and_insert(key);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.check_and_insert(key));
    }
}
