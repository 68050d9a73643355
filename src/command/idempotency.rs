//! Idempotency cache: repeated command ids return the cached response
//! instead of being re-applied. TTL is enforced on lookup since
//! `lru::LruCache` only bounds entry count, not age.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use uuid::Uuid;

use crate::model::Response;

const DEFAULT_CAPACITY: usize = 10_000;
/// Minimum TTL honored for a cached response ("TTL ≥ 10 minutes").
pub const MIN_TTL_MS: u64 = 10 * 60 * 1000;

pub struct IdempotencyCache {
    cache: Mutex<LruCache<Uuid, (Response, u64)>>,
    ttl_ms: u64,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_CAPACITY, MIN_TTL_MS)
    }

    pub fn with_capacity_and_ttl(capacity: usize, ttl_ms: u64) -> Self {
        let ttl_ms = ttl_ms.max(MIN_TTL_MS);
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            ttl_ms,
        }
    }

    /// Returns the cached response for `id` if present and not yet expired.
    /// An expired entry is dropped so future lookups don't keep finding it.
    pub fn get(&self, id: Uuid, now_ms: u64) -> Option<Response> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(&id) {
            Some((response, inserted_at)) if now_ms.saturating_sub(*inserted_at) < self.ttl_ms => {
                Some(response.clone())
            }
            Some(_) => {
                cache.pop(&id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, id: Uuid, response: Response, now_ms: u64) {
        self.cache.lock().unwrap().put(id, (response, now_ms));
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResponseStatus, ResponseValue};

    fn ok_response(id: Uuid) -> Response {
        Response { id, status: ResponseStatus::Ok, value: Some(ResponseValue::Str("v".into())), error: None }
    }

    #[test]
    fn repeated_id_returns_cached_response_within_ttl() {
        let cache = IdempotencyCache::new();
        let id = Uuid::new_v4();
        cache.insert(id, ok_response(id), 1_000);
        assert!(cache.get(id, 1_000 + 60_000).is_some());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = IdempotencyCache::with_capacity_and_ttl(10, MIN_TTL_MS);
        let id = Uuid::new_v4();
        cache.insert(id, ok_response(id), 0);
        assert!(cache.get(id, MIN_TTL_MS + 1).is_none());
    }

    #[test]
    fn unknown_id_is_a_miss() {
        let cache = IdempotencyCache::new();
        assert!(cache.get(Uuid::new_v4(), 0).is_none());
    }

    #[test]
    fn ttl_below_minimum_is_clamped_up() {
        let cache = IdempotencyCache::with_capacity_and_ttl(10, 1_000);
        let id = Uuid::new_v4();
        cache.insert(id, ok_response(id), 0);
        assert!(cache.get(id, 1_000).is_some());
    }
}
