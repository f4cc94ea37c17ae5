//! Warm tier: a shared, TTL-bounded cache between processes.
//!
//! The trait mirrors the small command set the sync core needs from a shared
//! cache (string values with expiry plus capped lists). [`MemoryWarmCache`]
//! is the in-process implementation; several cores sharing one instance
//! behave like several processes sharing one cache server.
//!
//! Expiry is measured on the tokio clock so tests with a paused clock can
//! step past a TTL deterministically.

use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Warm tier errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarmError {
    #[error("warm cache unavailable: {0}")]
    Unavailable(String),
    #[error("key {0} holds a value of the wrong kind")]
    WrongKind(String),
}

/// Shared cache contract.
pub trait WarmCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WarmError>;

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), WarmError>;

    fn delete(&self, key: &str) -> Result<(), WarmError>;

    /// Append to the list at `key`, drop the oldest items beyond `max_len`
    /// and refresh the key's TTL. Returns the list length after trimming.
    fn push_bounded(
        &self,
        key: &str,
        value: Vec<u8>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize, WarmError>;

    /// Whole list at `key`, oldest first. Missing keys read as empty.
    fn range(&self, key: &str) -> Result<Vec<Vec<u8>>, WarmError>;
}

/// Warm cache configuration.
#[derive(Debug, Clone)]
pub struct WarmCacheConfig {
    /// Maximum number of keys held before least-recently-used eviction.
    pub capacity: usize,
}

impl Default for WarmCacheConfig {
    fn default() -> Self {
        Self { capacity: 100_000 }
    }
}

#[derive(Debug)]
enum WarmValue {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct WarmEntry {
    value: WarmValue,
    expires_at: Instant,
}

impl WarmEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process warm cache with LRU capacity bound and per-key TTL.
pub struct MemoryWarmCache {
    entries: Mutex<LruCache<String, WarmEntry>>,
}

impl MemoryWarmCache {
    pub fn new(config: WarmCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(WarmCacheConfig::default())
    }

    /// Remaining lifetime of `key`, if it is live.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        let now = Instant::now();
        entries
            .peek(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Number of keys currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, WarmEntry>>, WarmError> {
        self.entries
            .lock()
            .map_err(|_| WarmError::Unavailable("cache mutex poisoned".into()))
    }
}

impl WarmCache for MemoryWarmCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WarmError> {
        let mut entries = self.lock()?;
        if !live_or_purge(&mut entries, key) {
            return Ok(None);
        }
        match entries.get(key) {
            Some(WarmEntry {
                value: WarmValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(WarmError::WrongKind(key.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), WarmError> {
        let mut entries = self.lock()?;
        entries.put(
            key.to_string(),
            WarmEntry {
                value: WarmValue::Bytes(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), WarmError> {
        self.lock()?.pop(key);
        Ok(())
    }

    fn push_bounded(
        &self,
        key: &str,
        value: Vec<u8>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize, WarmError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        if !live_or_purge(&mut entries, key) {
            entries.put(
                key.to_string(),
                WarmEntry {
                    value: WarmValue::List(VecDeque::new()),
                    expires_at: now + ttl,
                },
            );
        }
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| WarmError::Unavailable(format!("key {key} vanished during push")))?;
        let WarmValue::List(list) = &mut entry.value else {
            return Err(WarmError::WrongKind(key.to_string()));
        };

        list.push_back(value);
        while list.len() > max_len {
            list.pop_front();
        }
        let len = list.len();
        entry.expires_at = now + ttl;
        Ok(len)
    }

    fn range(&self, key: &str) -> Result<Vec<Vec<u8>>, WarmError> {
        let mut entries = self.lock()?;
        if !live_or_purge(&mut entries, key) {
            return Ok(Vec::new());
        }
        match entries.get(key) {
            Some(WarmEntry {
                value: WarmValue::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(WarmError::WrongKind(key.to_string())),
            None => Ok(Vec::new()),
        }
    }
}

/// True if `key` holds a live entry; an expired entry is removed.
fn live_or_purge(entries: &mut LruCache<String, WarmEntry>, key: &str) -> bool {
    let live = match entries.peek(key) {
        Some(entry) => entry.is_live(Instant::now()),
        None => return false,
    };
    if !live {
        entries.pop(key);
    }
    live
}
