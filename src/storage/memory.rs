use super::{CounterStore, Swap};
use crate::clock::{Clock, SystemClock};
use crate::{RateLimitError, Result};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    // unix seconds; the entry is gone once the clock reaches it
    expires_at: Option<u64>,
}

/// In-process counter store with TTL expiry.
///
/// Reads go straight to the map. Every mutation holds the commit lock, which
/// makes multi-key compare-and-swap and create-with-TTL increments atomic
/// with respect to each other. Expiry is lazy: expired entries are dropped
/// when touched.
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<DashMap<String, Entry>>,
    commit: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose TTLs are measured against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            commit: Arc::new(Mutex::new(())),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_secs();
        self.data
            .iter()
            .filter(|entry| !is_expired(entry.value(), now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.commit
            .lock()
            .map_err(|e| RateLimitError::StoreUnavailable(format!("memory store lock poisoned: {}", e)))
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now_secs();
        let entry = self.data.get(key).map(|entry| entry.value().clone())?;
        if is_expired(&entry, now) {
            self.data.remove_if(key, |_, e| is_expired(e, now));
            return None;
        }
        Some(entry)
    }

    fn expiry(&self, ttl_secs: Option<u64>) -> Option<u64> {
        ttl_secs.map(|ttl| self.clock.now_secs().saturating_add(ttl))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.data.len())
            .finish_non_exhaustive()
    }
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    matches!(entry.expires_at, Some(at) if at <= now)
}

#[async_trait::async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let _guard = self.lock()?;
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: self.expiry(ttl_secs),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_on_create: Option<u64>) -> Result<i64> {
        let _guard = self.lock()?;
        let (current, expires_at) = match self.live(key) {
            Some(entry) => {
                let current = entry.value.parse::<i64>().map_err(|_| RateLimitError::InvalidState {
                    key: key.to_string(),
                    value: entry.value.clone(),
                })?;
                (current, entry.expires_at)
            }
            None => (0, self.expiry(ttl_on_create)),
        };
        let next = current + 1;
        self.data.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn compare_and_swap(&self, swaps: &[Swap], ttl_secs: Option<u64>) -> Result<bool> {
        let _guard = self.lock()?;
        let matches = swaps.iter().all(|swap| {
            let current = self.live(&swap.key).map(|entry| entry.value);
            current == swap.expected
        });
        if !matches {
            return Ok(false);
        }
        let expires_at = self.expiry(ttl_secs);
        for swap in swaps {
            self.data.insert(
                swap.key.clone(),
                Entry {
                    value: swap.new.clone(),
                    expires_at,
                },
            );
        }
        Ok(true)
    }
}
