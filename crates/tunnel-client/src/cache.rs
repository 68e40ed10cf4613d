//! Control response cache keyed by request id (spec §4.5 "Poll loop" / §8
//! "Cache idempotence" and "Boundedness"). Entries expire after a TTL and the
//! cache evicts the oldest entry once it hits its size cap, tracked by a
//! parallel insertion-order queue.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tunnel_wire::TunnelPackage;

use crate::config::{CACHE_MAX_ENTRIES, CACHE_TTL};

struct Entry {
    package: TunnelPackage,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Request-id keyed cache of control responses received by the poll loop.
pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        ResponseCache {
            inner: Mutex::new(Inner::default()),
            max_entries: CACHE_MAX_ENTRIES,
            ttl: CACHE_TTL,
        }
    }

    pub fn with_limits(max_entries: usize, ttl: Duration) -> Self {
        ResponseCache { inner: Mutex::new(Inner::default()), max_entries, ttl }
    }

    /// Inserts a response, evicting the oldest entry if the cache is full.
    pub async fn insert(&self, request_id: String, package: TunnelPackage) {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(&request_id) {
            inner.order.push_back(request_id.clone());
        }
        inner.entries.insert(request_id, Entry { package, inserted_at: Instant::now() });

        while inner.entries.len() > self.max_entries {
            let Some(oldest) = inner.order.pop_front() else { break };
            inner.entries.remove(&oldest);
        }
    }

    /// Removes and returns the cached response for `request_id`, if present
    /// and not expired. Expired entries are dropped on lookup.
    pub async fn take(&self, request_id: &str) -> Option<TunnelPackage> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get(request_id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            inner.entries.remove(request_id);
            return None;
        }
        let entry = inner.entries.remove(request_id)?;
        Some(entry.package)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_wire::TunnelType;

    fn pkg(request_id: &str) -> TunnelPackage {
        TunnelPackage {
            request_id: Some(request_id.to_owned()),
            tunnel_type: Some(TunnelType::Control),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn take_removes_entry_exactly_once() {
        let cache = ResponseCache::new();
        cache.insert("r1".into(), pkg("r1")).await;
        assert!(cache.take("r1").await.is_some());
        assert!(cache.take("r1").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_dropped_on_lookup() {
        let cache = ResponseCache::with_limits(CACHE_MAX_ENTRIES, Duration::from_millis(10));
        cache.insert("r1".into(), pkg("r1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.take("r1").await.is_none());
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest_first() {
        let cache = ResponseCache::with_limits(2, CACHE_TTL);
        cache.insert("r1".into(), pkg("r1")).await;
        cache.insert("r2".into(), pkg("r2")).await;
        cache.insert("r3".into(), pkg("r3")).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.take("r1").await.is_none());
        assert!(cache.take("r2").await.is_some());
        assert!(cache.take("r3").await.is_some());
    }
}
