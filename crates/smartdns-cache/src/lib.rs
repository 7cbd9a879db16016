//! # SmartDNS Response Cache
//!
//! Dual positive/negative caching for resolved queries:
//!
//! - **Positive**: `(lowercase qname, qtype)` -> cached payload with an
//!   absolute expiry
//! - **Negative**: `(lowercase qname, qtype, rcode)` -> expiry only
//!
//! Both sides are fixed-capacity LRU maps. Expired entries are removed
//! passively on read. [`ResponseCache::invalidate_zone`] punches a
//! zone-suffix-shaped hole through both caches after a hot reload.
//!
//! Each cache has its own mutex and the two are never held together;
//! operations are short and non-reentrant.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PositiveKey {
    name: String,
    qtype: RecordType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NegativeKey {
    name: String,
    qtype: RecordType,
    rcode: u8,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    expires_at: Instant,
    data: T,
}

/// LRU response cache, generic over the cached payload.
///
/// The server caches whole response messages; tests cache whatever is
/// convenient.
pub struct ResponseCache<T> {
    positive: Mutex<LruCache<PositiveKey, Entry<T>>>,
    negative: Mutex<LruCache<NegativeKey, Instant>>,
}

impl<T: Clone> ResponseCache<T> {
    /// Creates a cache holding up to `capacity` positive entries and
    /// `capacity / 10` negative entries (each at least one).
    pub fn new(capacity: usize) -> Self {
        let positive = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        let negative = NonZeroUsize::new((capacity / 10).max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            positive: Mutex::new(LruCache::new(positive)),
            negative: Mutex::new(LruCache::new(negative)),
        }
    }

    fn positive_key(name: &str, qtype: RecordType) -> PositiveKey {
        PositiveKey {
            name: name.to_ascii_lowercase(),
            qtype,
        }
    }

    /// Returns the cached payload if present and not expired. Expired
    /// entries are evicted on the spot.
    pub fn get_positive(&self, name: &str, qtype: RecordType) -> Option<T> {
        let key = Self::positive_key(name, qtype);
        let mut cache = self.positive.lock();
        let expired = match cache.get(&key) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    return Some(entry.data.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            cache.pop(&key);
        }
        None
    }

    /// Stores a payload with `expires_at = now + ttl`.
    pub fn put_positive(&self, name: &str, qtype: RecordType, data: T, ttl: Duration) {
        let entry = Entry {
            expires_at: Instant::now() + ttl,
            data,
        };
        self.positive.lock().put(Self::positive_key(name, qtype), entry);
    }

    fn negative_key(name: &str, qtype: RecordType, rcode: ResponseCode) -> NegativeKey {
        NegativeKey {
            name: name.to_ascii_lowercase(),
            qtype,
            rcode: rcode.low(),
        }
    }

    /// Returns true if a live negative entry exists for this key.
    pub fn get_negative(&self, name: &str, qtype: RecordType, rcode: ResponseCode) -> bool {
        let key = Self::negative_key(name, qtype, rcode);
        let mut cache = self.negative.lock();
        let expired = match cache.get(&key) {
            Some(expires_at) => {
                if Instant::now() < *expires_at {
                    return true;
                }
                true
            }
            None => false,
        };
        if expired {
            cache.pop(&key);
        }
        false
    }

    /// Records a negative result for `ttl`.
    pub fn put_negative(&self, name: &str, qtype: RecordType, rcode: ResponseCode, ttl: Duration) {
        self.negative
            .lock()
            .put(Self::negative_key(name, qtype, rcode), Instant::now() + ttl);
    }

    /// Removes every entry, positive and negative, whose name ends with
    /// the given zone suffix.
    pub fn invalidate_zone(&self, zone_fqdn: &str) {
        let zone = zone_fqdn.to_ascii_lowercase();
        {
            let mut cache = self.positive.lock();
            let doomed: Vec<PositiveKey> = cache
                .iter()
                .filter(|(k, _)| k.name.ends_with(&zone))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                cache.pop(&key);
            }
        }
        {
            let mut cache = self.negative.lock();
            let doomed: Vec<NegativeKey> = cache
                .iter()
                .filter(|(k, _)| k.name.ends_with(&zone))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                cache.pop(&key);
            }
        }
    }

    /// Drops everything from both caches.
    pub fn clear(&self) {
        self.positive.lock().clear();
        self.negative.lock().clear();
    }

    /// Returns the number of live-or-expired positive entries.
    pub fn positive_len(&self) -> usize {
        self.positive.lock().len()
    }

    /// Returns the number of live-or-expired negative entries.
    pub fn negative_len(&self) -> usize {
        self.negative.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn positive_round_trip() {
        let cache: ResponseCache<u32> = ResponseCache::new(16);
        cache.put_positive("www.example.com.", RecordType::A, 7, Duration::from_secs(10));
        assert_eq!(cache.get_positive("www.example.com.", RecordType::A), Some(7));
        // Keys are normalized to lowercase.
        assert_eq!(cache.get_positive("WWW.EXAMPLE.COM.", RecordType::A), Some(7));
        assert_eq!(cache.get_positive("www.example.com.", RecordType::AAAA), None);
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache: ResponseCache<u32> = ResponseCache::new(16);
        cache.put_positive("a.example.", RecordType::A, 1, Duration::from_millis(10));
        sleep(Duration::from_millis(30));
        assert_eq!(cache.get_positive("a.example.", RecordType::A), None);
        assert_eq!(cache.positive_len(), 0);
    }

    #[test]
    fn negative_round_trip_and_expiry() {
        let cache: ResponseCache<u32> = ResponseCache::new(16);
        cache.put_negative(
            "gone.example.",
            RecordType::A,
            ResponseCode::NXDomain,
            Duration::from_secs(10),
        );
        assert!(cache.get_negative("gone.example.", RecordType::A, ResponseCode::NXDomain));
        assert!(!cache.get_negative("gone.example.", RecordType::A, ResponseCode::ServFail));

        cache.put_negative(
            "brief.example.",
            RecordType::A,
            ResponseCode::NXDomain,
            Duration::from_millis(10),
        );
        sleep(Duration::from_millis(30));
        assert!(!cache.get_negative("brief.example.", RecordType::A, ResponseCode::NXDomain));
    }

    #[test]
    fn invalidate_zone_removes_suffix_matches_only() {
        let cache: ResponseCache<u32> = ResponseCache::new(16);
        cache.put_positive("a.example.com.", RecordType::A, 1, Duration::from_secs(60));
        cache.put_positive("b.example.com.", RecordType::A, 2, Duration::from_secs(60));
        cache.put_positive("c.example.org.", RecordType::A, 3, Duration::from_secs(60));
        cache.put_negative(
            "d.example.com.",
            RecordType::A,
            ResponseCode::NXDomain,
            Duration::from_secs(60),
        );

        cache.invalidate_zone("example.com.");

        assert_eq!(cache.get_positive("a.example.com.", RecordType::A), None);
        assert_eq!(cache.get_positive("b.example.com.", RecordType::A), None);
        assert_eq!(cache.get_positive("c.example.org.", RecordType::A), Some(3));
        assert!(!cache.get_negative("d.example.com.", RecordType::A, ResponseCode::NXDomain));
    }

    #[test]
    fn capacity_is_bounded_lru() {
        let cache: ResponseCache<u32> = ResponseCache::new(2);
        cache.put_positive("a.", RecordType::A, 1, Duration::from_secs(60));
        cache.put_positive("b.", RecordType::A, 2, Duration::from_secs(60));
        cache.put_positive("c.", RecordType::A, 3, Duration::from_secs(60));
        // Oldest entry fell out.
        assert_eq!(cache.get_positive("a.", RecordType::A), None);
        assert_eq!(cache.get_positive("c.", RecordType::A), Some(3));
        assert_eq!(cache.positive_len(), 2);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache: ResponseCache<u32> = ResponseCache::new(0);
        cache.put_positive("a.", RecordType::A, 1, Duration::from_secs(60));
        assert_eq!(cache.get_positive("a.", RecordType::A), Some(1));
    }
}
