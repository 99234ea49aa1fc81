//! Counter storage for the rate limiter.
//!
//! The store is the only state shared across invocations. Backends must
//! provide atomic get-or-create-then-bump semantics for `increment`: a lost
//! update under concurrent callers silently under-counts and defeats the
//! quota. The in-process reference implementation gets this from per-key
//! locking; a distributed backend must supply an equivalent primitive
//! (e.g. a scripted read-modify-write).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Clock, SystemClock};

/// One counter window for a `(identifier, tool)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests counted in the current window
    pub count: u64,
    /// Epoch milliseconds at which the current window ends
    pub reset_time: i64,
    /// Epoch milliseconds until which the key is blocked outright, if escalated
    pub block_until: Option<i64>,
}

/// Storage backend failure.
///
/// The engine never surfaces these to callers; they trigger fail-open.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("rate limit store backend error: {0}")]
    Backend(String),
}

/// Pluggable counter storage keyed by the engine's generated key.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Read the entry for a key, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<RateLimitEntry>, StoreError>;

    /// Write an entry, optionally bounding its lifetime.
    async fn set(
        &self,
        key: &str,
        entry: RateLimitEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Atomically bump the window counter, opening a new window when none
    /// exists or the previous one has lapsed. A still-valid `block_until`
    /// carries forward across the window reset. Returns the post-increment
    /// entry.
    async fn increment(
        &self,
        key: &str,
        window_ms: i64,
        ttl: Option<Duration>,
    ) -> Result<RateLimitEntry, StoreError>;

    /// Remove one key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove everything.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Stored entry plus its expiry deadline.
#[derive(Debug, Clone)]
struct StoredEntry {
    entry: RateLimitEntry,
    expires_at: Option<i64>,
}

/// In-process reference store.
///
/// Entries expire lazily on read, with a periodic sweep to bound memory for
/// keys that are never read again. Single-process correctness only.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn is_expired(&self, stored: &StoredEntry, now: i64) -> bool {
        stored.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Remove expired entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries
            .retain(|_, stored| !stored.expires_at.is_some_and(|deadline| now >= deadline));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "swept expired rate limit entries");
        }
        removed
    }

    /// Number of live keys (includes entries awaiting lazy expiry).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a background task that periodically sweeps expired entries.
    ///
    /// The task runs every `period` and stops when the cancellation token
    /// is triggered.
    pub fn spawn_sweep_task(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        store.sweep();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("rate limit store sweep task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitEntry>, StoreError> {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(stored) => self.is_expired(&stored, now),
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|stored| stored.entry.clone()))
    }

    async fn set(
        &self,
        key: &str,
        entry: RateLimitEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                entry,
                expires_at: ttl.map(|d| now + d.as_millis() as i64),
            },
        );
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: i64,
        ttl: Option<Duration>,
    ) -> Result<RateLimitEntry, StoreError> {
        let now = self.clock.now_ms();
        let expires_at = ttl.map(|d| now + d.as_millis() as i64);

        // The DashMap entry guard holds the shard lock for the whole
        // read-modify-write, which is what makes this increment atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let lapsed = self.is_expired(stored, now);
                if lapsed || now >= stored.entry.reset_time {
                    // New window; an unexpired block survives the reset
                    // unless the whole entry's lifetime lapsed.
                    let carried = if lapsed {
                        None
                    } else {
                        stored.entry.block_until.filter(|b| *b > now)
                    };
                    stored.entry = RateLimitEntry {
                        count: 1,
                        reset_time: now + window_ms,
                        block_until: carried,
                    };
                } else {
                    stored.entry.count += 1;
                }
                stored.expires_at = expires_at;
                Ok(stored.entry.clone())
            }
            Entry::Vacant(vacant) => {
                let entry = RateLimitEntry {
                    count: 1,
                    reset_time: now + window_ms,
                    block_until: None,
                };
                vacant.insert(StoredEntry {
                    entry: entry.clone(),
                    expires_at,
                });
                Ok(entry)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}
