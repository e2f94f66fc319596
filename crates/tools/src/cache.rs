//! Short-TTL memoization of tool results.
//!
//! Keyed by a canonical fingerprint of (tool name, arguments with object keys
//! sorted recursively). Only successful results are stored; expired entries
//! are never returned. Concurrent dispatches of the same fingerprint coalesce
//! behind a per-fingerprint single-flight guard so at most one executes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use vx_domain::message::ToolResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonical cache key for a (tool, arguments) pair.
///
/// Object keys are sorted recursively so semantically equal argument maps
/// produce byte-equal fingerprints regardless of construction order.
pub fn fingerprint(tool_name: &str, args: &Value) -> String {
    format!("{tool_name}:{}", canonicalize(args))
}

fn canonicalize(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CacheEntry {
    result: ToolResult,
    stored_at: Instant,
}

pub struct ToolCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Per-fingerprint single-flight guards.
    guards: Mutex<HashMap<String, Arc<Semaphore>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for the fingerprint, if any. Expired entries are dropped
    /// on sight.
    pub fn lookup(&self, fingerprint: &str) -> Option<ToolResult> {
        let mut entries = self.entries.lock();
        match entries.get(fingerprint) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Store a result. Failures are never cached.
    pub fn store(&self, fingerprint: &str, result: &ToolResult) {
        if !result.success {
            return;
        }
        self.entries.lock().insert(
            fingerprint.to_string(),
            CacheEntry {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Cached-or-computed result with single-flight coalescing.
    ///
    /// For `cacheable = false` the compute always runs and nothing is stored.
    /// Returns `(result, was_hit)`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        cacheable: bool,
        compute: F,
    ) -> (ToolResult, bool)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ToolResult>,
    {
        if !cacheable {
            return (compute().await, false);
        }

        if let Some(result) = self.lookup(fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (result, true);
        }

        let guard = {
            let mut guards = self.guards.lock();
            guards
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // Holders of the permit either find the result a coalesced first
        // flight stored, or run the compute themselves. The semaphore is
        // never closed, so a failed acquire just degrades to an unguarded
        // compute.
        let _permit = guard.acquire().await.ok();
        if let Some(result) = self.lookup(fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (result, true);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = compute().await;
        self.store(fingerprint, &result);
        (result, false)
    }

    /// Drop expired entries and idle single-flight guards.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .retain(|_, entry| entry.stored_at.elapsed() < ttl);
        // A guard with no outside holders has no in-flight compute.
        self.guards
            .lock()
            .retain(|_, guard| Arc::strong_count(guard) > 1);
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_result(data: Value) -> ToolResult {
        ToolResult::ok("c1", data, 5)
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let a = fingerprint("web_search", &json!({"b": 2, "a": {"y": 1, "x": 0}}));
        let b = fingerprint("web_search", &json!({"a": {"x": 0, "y": 1}, "b": 2}));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_tools_and_args() {
        let base = fingerprint("web_search", &json!({"q": "x"}));
        assert_ne!(base, fingerprint("get_time", &json!({"q": "x"})));
        assert_ne!(base, fingerprint("web_search", &json!({"q": "y"})));
    }

    #[test]
    fn fingerprint_preserves_array_order() {
        let a = fingerprint("t", &json!({"ids": [1, 2]}));
        let b = fingerprint("t", &json!({"ids": [2, 1]}));
        assert_ne!(a, b);
    }

    #[test]
    fn store_and_lookup_within_ttl() {
        let cache = ToolCache::new(Duration::from_secs(300));
        let result = ok_result(json!({"n": 1}));
        cache.store("fp", &result);
        assert_eq!(cache.lookup("fp").unwrap(), result);
    }

    #[test]
    fn expired_entries_never_returned() {
        let cache = ToolCache::new(Duration::from_millis(0));
        cache.store("fp", &ok_result(json!(1)));
        assert!(cache.lookup("fp").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = ToolCache::new(Duration::from_secs(300));
        let err = vx_domain::Error::ToolFault("bad".into());
        cache.store("fp", &ToolResult::fail("c1", &err, 1));
        assert!(cache.lookup("fp").is_none());
    }

    #[tokio::test]
    async fn second_compute_observes_first_result() {
        let cache = ToolCache::new(Duration::from_secs(300));
        let (first, hit) = cache
            .get_or_compute("fp", true, || async { ok_result(json!({"v": 1})) })
            .await;
        assert!(!hit);
        let (second, hit) = cache
            .get_or_compute("fp", true, || async { ok_result(json!({"v": 2})) })
            .await;
        assert!(hit);
        // Byte-identical result surfaced.
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[tokio::test]
    async fn non_cacheable_always_computes() {
        let cache = ToolCache::new(Duration::from_secs(300));
        for i in 0..2 {
            let (result, hit) = cache
                .get_or_compute("fp", false, || async move { ok_result(json!({"i": i})) })
                .await;
            assert!(!hit);
            assert_eq!(result.data["i"], i);
        }
        assert_eq!(cache.hit_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_same_fingerprint_coalesces() {
        use std::sync::atomic::AtomicU32;

        let cache = Arc::new(ToolCache::new(Duration::from_secs(300)));
        let computes = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let computes = computes.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute("fp", true, || async move {
                            computes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            ok_result(json!({"v": 1}))
                        })
                        .await
                        .0
                })
            })
            .collect();

        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.data["v"], 1);
        }
        // Exactly one flight executed; the rest coalesced.
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweep_drops_expired_and_idle_guards() {
        let cache = ToolCache::new(Duration::from_millis(1));
        let (_, _) = cache
            .get_or_compute("fp", true, || async { ok_result(json!(1)) })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep();
        assert!(cache.is_empty());
        assert!(cache.guards.lock().is_empty());
    }
}
