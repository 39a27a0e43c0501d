//! Counter store abstraction and the default in-memory backend.
//!
//! Counters are namespaced by segment (one per dimension) and keyed by the
//! dimension key. Stores only need get-with-metadata and set-with-TTL; there is
//! no atomic increment, so concurrent updates of one key may lose increments.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;

/// A value persisted under a counter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    /// Request count for the path, user and user-path dimensions
    Count(u64),
    /// Short hashes of rejected auth tokens for the auth dimension
    Tokens(Vec<String>),
}

/// A stored value read back together with its cache metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    /// The stored value
    pub value: StoredValue,
    /// Time left before the entry expires
    pub ttl: Duration,
    /// Whether the store considers the entry stale
    pub stale: bool,
}

/// Backing key-value store for rate limit counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the entry stored under `key` in `segment`.
    ///
    /// Returns `None` when the key is absent or has expired.
    async fn get(&self, segment: &str, key: &str) -> Result<Option<Cached>>;

    /// Store `value` under `key` in `segment`, expiring after `ttl`.
    async fn set(&self, segment: &str, key: &str, value: StoredValue, ttl: Duration) -> Result<()>;
}

/// A counter family: one segment of a backing store.
#[derive(Clone)]
pub struct Segment {
    store: Arc<dyn CounterStore>,
    name: String,
}

impl Segment {
    /// Create a handle to `name` inside `store`.
    pub fn new(store: Arc<dyn CounterStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// The segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read an entry from this segment.
    pub async fn get(&self, key: &str) -> Result<Option<Cached>> {
        self.store.get(&self.name, key).await
    }

    /// Write an entry to this segment.
    pub async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        self.store.set(&self.name, key, value, ttl).await
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: StoredValue,
    expires_at: Instant,
}

/// In-process counter store backed by a sharded concurrent map.
///
/// Expired entries are invisible to `get` and are reclaimed by
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), MemoryEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        trace!(purged = purged, "Purged expired counters");
        purged
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, segment: &str, key: &str) -> Result<Option<Cached>> {
        let now = Instant::now();
        let cached = self
            .entries
            .get(&(segment.to_string(), key.to_string()))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| Cached {
                value: entry.value.clone(),
                ttl: entry.expires_at - now,
                stale: false,
            });
        Ok(cached)
    }

    async fn set(&self, segment: &str, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .insert((segment.to_string(), key.to_string()), entry);
        Ok(())
    }
}
