//! Shared cache, coalescer, and premium-quota store.
//!
//! One logical component backed by a networked key-value store (Redis or a
//! compatible wire-protocol server). The `SharedStore` trait lets the
//! dispatcher and its tests depend on behavior rather than a live network
//! service; `RedisStore` is the real backend.

mod redis_store;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::CacheEntry;

pub use redis_store::RedisStore;

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub owner: String,
    pub started_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PremiumReservation {
    pub allowed: bool,
    pub total_count: i64,
    pub claude_count: i64,
    pub projected_ratio: f64,
    pub member: Option<String>,
}

/// Keyspace and operations behind §4.5. Every fallible operation already
/// embeds its own fail-open/fail-closed policy — callers never need to
/// branch on "store unreachable" themselves.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn ping(&self) -> bool;

    /// Decoded cache entry, or `None` on miss or decode failure (treated
    /// as a miss per §4.5 failure policy).
    async fn get_cache(&self, fingerprint: &str) -> Option<CacheEntry>;
    async fn set_cache(&self, fingerprint: &str, entry: &CacheEntry);

    /// Atomic set-if-absent on the lock key. Store errors are treated as
    /// lock-acquired (fail-open, §4.5) to preserve availability.
    async fn try_acquire_lock(&self, fingerprint: &str, owner: &str) -> bool;
    async fn get_lock(&self, fingerprint: &str) -> Option<LockInfo>;
    /// Best-effort; errors are swallowed, the lock TTL is the backstop.
    async fn release_lock(&self, fingerprint: &str, owner: &str);

    async fn set_dedupe_result(&self, fingerprint: &str, entry: &CacheEntry);
    /// Polls `cache:{fp}` then `dedupe:result:{fp}` until a value appears
    /// or `deadline` elapses.
    async fn wait_for_result(&self, fingerprint: &str, deadline: Instant) -> Option<CacheEntry>;

    async fn record_total_request(&self, request_id: &str);
    /// Fails closed: any store error denies the premium path (§4.5).
    async fn try_reserve_premium(&self, request_id: &str) -> PremiumReservation;
    async fn release_premium_reservation(&self, member: &str);
}

/// In-process fake used by dispatcher/unit tests — no network dependency.
/// Implements the same single-flight and quota semantics as the Redis
/// backend, backed by a `tokio::sync::Mutex`-guarded map instead of a
/// networked store.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        cache: HashMap<String, CacheEntry>,
        locks: HashMap<String, LockInfo>,
        dedupe_results: HashMap<String, CacheEntry>,
        total: Vec<i64>,
        claude: Vec<String>,
    }

    pub struct FakeStore {
        inner: Mutex<Inner>,
        cap_ratio: f64,
        now_ms: AtomicI64,
    }

    impl FakeStore {
        pub fn new(cap_ratio: f64) -> Self {
            Self {
                inner: Mutex::new(Inner::default()),
                cap_ratio,
                now_ms: AtomicI64::new(0),
            }
        }

        /// Deterministic clock for tests instead of wall time.
        pub fn advance_ms(&self, delta: i64) {
            self.now_ms.fetch_add(delta, Ordering::SeqCst);
        }

        fn now(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SharedStore for FakeStore {
        async fn ping(&self) -> bool {
            true
        }

        async fn get_cache(&self, fingerprint: &str) -> Option<CacheEntry> {
            self.inner.lock().await.cache.get(fingerprint).cloned()
        }

        async fn set_cache(&self, fingerprint: &str, entry: &CacheEntry) {
            self.inner
                .lock()
                .await
                .cache
                .insert(fingerprint.to_string(), entry.clone());
        }

        async fn try_acquire_lock(&self, fingerprint: &str, owner: &str) -> bool {
            let mut inner = self.inner.lock().await;
            if inner.locks.contains_key(fingerprint) {
                return false;
            }
            inner.locks.insert(
                fingerprint.to_string(),
                LockInfo {
                    owner: owner.to_string(),
                    started_ms: self.now(),
                },
            );
            true
        }

        async fn get_lock(&self, fingerprint: &str) -> Option<LockInfo> {
            self.inner.lock().await.locks.get(fingerprint).cloned()
        }

        async fn release_lock(&self, fingerprint: &str, owner: &str) {
            let mut inner = self.inner.lock().await;
            if inner.locks.get(fingerprint).is_some_and(|l| l.owner == owner) {
                inner.locks.remove(fingerprint);
            }
        }

        async fn set_dedupe_result(&self, fingerprint: &str, entry: &CacheEntry) {
            self.inner
                .lock()
                .await
                .dedupe_results
                .insert(fingerprint.to_string(), entry.clone());
        }

        async fn wait_for_result(&self, fingerprint: &str, deadline: Instant) -> Option<CacheEntry> {
            loop {
                {
                    let inner = self.inner.lock().await;
                    if let Some(entry) = inner.cache.get(fingerprint) {
                        return Some(entry.clone());
                    }
                    if let Some(entry) = inner.dedupe_results.get(fingerprint) {
                        return Some(entry.clone());
                    }
                }
                if Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }

        async fn record_total_request(&self, _request_id: &str) {
            let now = self.now();
            self.inner.lock().await.total.push(now);
        }

        async fn try_reserve_premium(&self, request_id: &str) -> PremiumReservation {
            let mut inner = self.inner.lock().await;
            let total_count = inner.total.len() as i64;
            let claude_count = inner.claude.len() as i64;
            if total_count == 0 {
                return PremiumReservation {
                    allowed: false,
                    total_count,
                    claude_count,
                    projected_ratio: 0.0,
                    member: None,
                };
            }
            let projected_ratio = (claude_count + 1) as f64 / total_count as f64;
            if projected_ratio <= self.cap_ratio {
                let now = self.now();
                let member = format!("{now}:{request_id}");
                inner.claude.push(member.clone());
                PremiumReservation {
                    allowed: true,
                    total_count,
                    claude_count,
                    projected_ratio,
                    member: Some(member),
                }
            } else {
                PremiumReservation {
                    allowed: false,
                    total_count,
                    claude_count,
                    projected_ratio,
                    member: None,
                }
            }
        }

        async fn release_premium_reservation(&self, member: &str) {
            let mut inner = self.inner.lock().await;
            inner.claude.retain(|m| m != member);
        }
    }
}
