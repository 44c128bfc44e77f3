//! Per-key state for stateful processors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as KeyLock;

use crate::model::IdentificationHash;

/// The default number of shards of a keyed state map.
const DEFAULT_SHARDS: usize = 64;

type Shard<V> = HashMap<IdentificationHash, Arc<KeyLock<V>>>;

/// A concurrent map from identification hash to per-key state.
///
/// The map is split into shards, each guarded by a short-lived lock used only to look up or
/// insert an entry. The state of each key sits behind its own async lock, so that work on
/// different keys never contends.
pub struct KeyedState<V> {
    shards: Vec<Mutex<Shard<V>>>,
}

impl<V: Default> Default for KeyedState<V> {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl<V: Default> KeyedState<V> {
    /// Create a new instance with the default number of shards.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new instance with the given number of shards, at least one.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// The state of the given key, created with its default value if absent.
    pub fn entry(&self, hash: IdentificationHash) -> Arc<KeyLock<V>> {
        self.shard(hash).entry(hash).or_default().clone()
    }
}

impl<V> KeyedState<V> {
    /// The state of the given key, if present.
    pub fn get(&self, hash: IdentificationHash) -> Option<Arc<KeyLock<V>>> {
        self.shard(hash).get(&hash).cloned()
    }

    /// Remove the state of the given key.
    ///
    /// Holders of the removed state keep it alive, but it is no longer reachable through this map.
    pub fn remove(&self, hash: IdentificationHash) -> Option<Arc<KeyLock<V>>> {
        self.shard(hash).remove(&hash)
    }

    /// Remove and return the state of every key, e.g. to flush it during shutdown.
    pub fn drain(&self) -> Vec<(IdentificationHash, Arc<KeyLock<V>>)> {
        self.shards.iter().flat_map(|shard| lock(shard).drain().collect::<Vec<_>>()).collect()
    }

    /// The identification hashes of every key currently holding state.
    pub fn keys(&self) -> Vec<IdentificationHash> {
        self.shards.iter().flat_map(|shard| lock(shard).keys().copied().collect::<Vec<_>>()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| lock(shard).is_empty())
    }

    fn shard(&self, hash: IdentificationHash) -> MutexGuard<'_, Shard<V>> {
        lock(&self.shards[(hash.value() % self.shards.len() as u64) as usize])
    }
}

/// Lock a shard. Shard locks are never held across a panic-prone call, so a poisoned lock still
/// holds a consistent map.
fn lock<V>(shard: &Mutex<Shard<V>>) -> MutexGuard<'_, Shard<V>> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
