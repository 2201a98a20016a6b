//! Pluggable key/value cache consumed by the Transaction Manager and
//! Batch Engine (§4.6). [`MemoryCache`] is the concrete in-memory
//! default; [`RemoteCache`] is a thin, constructible stand-in for a
//! remote backend since no concrete remote protocol is in scope (§1).

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glob::Pattern;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::CacheError;

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// The small capability set every cache backend must satisfy (§9
/// "duck-typed cache backends"). The Transaction layer depends only on
/// this trait, never on a concrete backend.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError>;
    async fn invalidate_model(&self, model: &str) -> Result<usize, CacheError>;
    async fn get_stats(&self) -> CacheStats;
    async fn close(&self);
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory LRU+TTL cache backed by the `lru` crate, guarded by a
/// `parking_lot::Mutex`, the same synchronous lock `session_pool.rs`
/// uses for its idle queue. TTL expiry is checked lazily on `get`.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        MemoryCache { entries: Mutex::new(LruCache::new(cap)), default_ttl, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at.map(|exp| Instant::now() >= exp).unwrap_or(false) {
                entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.value.clone()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        self.entries.lock().put(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let glob = Pattern::new(pattern).map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut entries = self.entries.lock();
        let matching: Vec<String> = entries.iter().map(|(k, _)| k.clone()).filter(|k| glob.matches(k)).collect();
        for key in &matching {
            entries.pop(key);
        }
        Ok(matching.len())
    }

    async fn invalidate_model(&self, model: &str) -> Result<usize, CacheError> {
        let mut count = 0;
        if self.entries.lock().pop(model).is_some() {
            count += 1;
        }
        for pattern in crate::transaction::model_invalidation_patterns(model) {
            count += self.invalidate_pattern(&pattern).await?;
        }
        Ok(count)
    }

    async fn get_stats(&self) -> CacheStats {
        CacheStats {
            backend: "memory",
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    async fn close(&self) {
        self.entries.lock().clear();
    }
}

/// Thin remote-backend stand-in: forwards to a configured URL over
/// plain HTTP GET/POST `key`/`value` calls and falls back to a local
/// [`MemoryCache`] when the remote call fails and `enable_fallback` is
/// set. The wire format is intentionally minimal since no concrete
/// remote cache protocol is pinned down elsewhere (§1, §4.6.1).
///
/// `circuit_breaker_threshold` consecutive remote failures trip a
/// short-lived breaker: while tripped, calls skip the remote round-trip
/// entirely and go straight to the local fallback, the same way
/// [`crate::transport::circuit_breaker::CircuitBreaker`] short-circuits
/// pool acquisition after repeated transport failures (§4.1, §6).
pub struct RemoteCache {
    client: reqwest::Client,
    base_url: String,
    enable_fallback: bool,
    local: MemoryCache,
    breaker_threshold: u32,
    consecutive_failures: AtomicU64,
    tripped_until: Mutex<Option<Instant>>,
}

const CACHE_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

impl RemoteCache {
    pub fn new(base_url: impl Into<String>, enable_fallback: bool, max_size: usize, ttl: Duration) -> Self {
        Self::with_breaker_threshold(base_url, enable_fallback, max_size, ttl, 5)
    }

    pub fn with_breaker_threshold(base_url: impl Into<String>, enable_fallback: bool, max_size: usize, ttl: Duration, breaker_threshold: u32) -> Self {
        RemoteCache {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            enable_fallback,
            local: MemoryCache::new(max_size, ttl),
            breaker_threshold: breaker_threshold.max(1),
            consecutive_failures: AtomicU64::new(0),
            tripped_until: Mutex::new(None),
        }
    }

    fn breaker_tripped(&self) -> bool {
        let until = *self.tripped_until.lock();
        match until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *self.tripped_until.lock() = None;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    fn record_remote_outcome(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.breaker_threshold as u64 {
            *self.tripped_until.lock() = Some(Instant::now() + CACHE_BREAKER_COOLDOWN);
        }
    }
}

#[async_trait]
impl Cache for RemoteCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if self.breaker_tripped() {
            return if self.enable_fallback { self.local.get(key).await } else { Err(CacheError::Unavailable) };
        }
        let url = format!("{}/cache/{}", self.base_url, key);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.record_remote_outcome(true);
                Ok(resp.json::<Value>().await.ok())
            }
            Ok(resp) if resp.status().as_u16() == 404 => {
                self.record_remote_outcome(true);
                Ok(None)
            }
            _ if self.enable_fallback => {
                self.record_remote_outcome(false);
                self.local.get(key).await
            }
            _ => {
                self.record_remote_outcome(false);
                Err(CacheError::Unavailable)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.breaker_tripped() {
            return if self.enable_fallback { self.local.set(key, value, ttl).await } else { Err(CacheError::Unavailable) };
        }
        let url = format!("{}/cache/{}", self.base_url, key);
        match self.client.put(&url).json(&value).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.record_remote_outcome(true);
                Ok(())
            }
            _ if self.enable_fallback => {
                self.record_remote_outcome(false);
                self.local.set(key, value, ttl).await
            }
            _ => {
                self.record_remote_outcome(false);
                Err(CacheError::Unavailable)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if !self.breaker_tripped() {
            let url = format!("{}/cache/{}", self.base_url, key);
            let outcome = self.client.delete(&url).send().await;
            self.record_remote_outcome(outcome.is_ok());
        }
        self.local.delete(key).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        self.local.invalidate_pattern(pattern).await
    }

    async fn invalidate_model(&self, model: &str) -> Result<usize, CacheError> {
        self.local.invalidate_model(model).await
    }

    async fn get_stats(&self) -> CacheStats {
        let mut stats = self.local.get_stats().await;
        stats.backend = "remote";
        stats
    }

    async fn close(&self) {
        self.local.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remote_cache_breaker_trips_after_threshold_and_falls_back() {
        // Unresolvable host so every remote call fails fast.
        let cache = RemoteCache::with_breaker_threshold("http://127.0.0.1:1", true, 10, Duration::from_secs(60), 2);
        cache.set("k", Value::String("v".into()), None).await.unwrap();
        cache.set("k", Value::String("v".into()), None).await.unwrap();
        assert!(cache.breaker_tripped());
        // Tripped: get() must not attempt the remote round-trip and still
        // serve from the local fallback.
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::String("v".into())));
    }

    #[tokio::test]
    async fn set_then_get_within_ttl_returns_value() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("res.partner:1", Value::String("x".into()), None).await.unwrap();
        assert_eq!(cache.get("res.partner:1").await.unwrap(), Some(Value::String("x".into())));
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_lazily() {
        let cache = MemoryCache::new(10, Duration::from_millis(10));
        cache.set("k", Value::Bool(true), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_pattern_deletes_matching_keys_only() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("res.partner:1", Value::Null, None).await.unwrap();
        cache.set("res.partner:2", Value::Null, None).await.unwrap();
        cache.set("res.company:1", Value::Null, None).await.unwrap();
        let removed = cache.invalidate_pattern("res.partner:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("res.company:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_model_removes_model_key_and_patterns() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        cache.set("res.partner", Value::Null, None).await.unwrap();
        cache.set("query:res.partner:abc", Value::Null, None).await.unwrap();
        let removed = cache.invalidate_model("res.partner").await.unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn lru_evicts_oldest_when_over_capacity() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.set("a", Value::Null, None).await.unwrap();
        cache.set("b", Value::Null, None).await.unwrap();
        cache.set("c", Value::Null, None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.get("c").await.unwrap().is_some());
    }
}
