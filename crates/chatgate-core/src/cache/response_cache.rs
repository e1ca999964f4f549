//! In-memory response cache.
//!
//! Content-addressed by a SHA-256 digest of the conversation and the target
//! parameters, with per-entry TTL and least-recently-accessed bulk eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{FinishReason, NormalizedRequest, NormalizedResponse};

pub const DEFAULT_TTL: Duration = Duration::from_millis(300_000);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_EVICTION_BATCH: usize = 100;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub eviction_batch: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            eviction_batch: DEFAULT_EVICTION_BATCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub response: NormalizedResponse,
    pub created_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed: Instant,
    /// Tie-breaker for entries touched within the same clock tick.
    access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Approximate bytes held by cached keys and content.
    pub size: usize,
    pub hit_rate: f64,
    pub entry_count: usize,
    pub average_age_seconds: f64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Response cache shared by all callers of one abstraction layer.
///
/// Every operation takes the lock synchronously and never awaits while
/// holding it, so check-then-act sequences are atomic.
#[derive(Debug, Default)]
pub struct ResponseCache {
    inner: Mutex<Inner>,
    options: CacheOptions,
}

impl ResponseCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            options,
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    /// Deterministic key over conversation content and target parameters.
    ///
    /// Transport fields (stream flag) and caller identity are excluded.
    pub fn generate_key(request: &NormalizedRequest, provider_instance_id: &str) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        field(&(request.messages.len() as u64).to_le_bytes());
        for msg in &request.messages {
            field(msg.role.to_string().as_bytes());
            field(msg.content.as_bytes());
        }
        field(request.model.as_bytes());
        field(&request.temperature.to_bits().to_le_bytes());
        field(&request.max_tokens.to_le_bytes());
        field(provider_instance_id.as_bytes());

        format!("CACHE#chat#{:x}", hasher.finalize())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a response, expiring it lazily. Hits are returned with `cached = true`.
    pub fn get(&self, key: &str) -> Option<NormalizedResponse> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            debug!("Cache entry expired: {}", key);
            return None;
        }

        let seq = inner.next_seq();
        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        entry.access_seq = seq;

        let mut response = entry.response.clone();
        response.metadata.cached = true;
        Some(response)
    }

    /// Store a response. Error responses are ignored.
    pub fn put(&self, key: impl Into<String>, response: NormalizedResponse, ttl: Option<Duration>) {
        if response.finish_reason == FinishReason::Error {
            debug!("Not caching error response {}", response.id);
            return;
        }

        let key = key.into();
        let now = Instant::now();
        let mut inner = self.lock();
        let seq = inner.next_seq();
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                response,
                created_at: now,
                ttl: ttl.unwrap_or(self.options.default_ttl),
                access_count: 0,
                last_accessed: now,
                access_seq: seq,
            },
        );

        if inner.entries.len() > self.options.max_entries {
            let evicted = Self::evict_lru(&mut inner, self.options.eviction_batch);
            debug!("Cache over capacity, evicted {} entries", evicted);
        }
    }

    fn evict_lru(inner: &mut Inner, count: usize) -> usize {
        let mut order: Vec<(Instant, u64, String)> = inner
            .entries
            .values()
            .map(|e| (e.last_accessed, e.access_seq, e.key.clone()))
            .collect();
        order.sort_unstable();

        let victims = order.into_iter().take(count.max(1));
        let mut removed = 0;
        for (_, _, key) in victims {
            if inner.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Drop every entry and reset hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Remove all TTL-expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.lock();
        let entry_count = inner.entries.len();
        let size = inner
            .entries
            .values()
            .map(|e| e.key.len() + e.response.content.len())
            .sum();
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        let average_age_seconds = if entry_count == 0 {
            0.0
        } else {
            inner
                .entries
                .values()
                .map(|e| now.saturating_duration_since(e.created_at).as_secs_f64())
                .sum::<f64>()
                / entry_count as f64
        };

        CacheStats {
            size,
            hit_rate,
            entry_count,
            average_age_seconds,
        }
    }

    /// Periodically purge expired entries until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("Cache sweep removed {} expired entries", removed);
                }
            }
        })
    }
}
