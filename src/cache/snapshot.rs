//! Immutable cache snapshots.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// A fully populated copy of one configuration collection.
///
/// Built in one go by a reload and swapped in atomically; never mutated
/// afterwards. Readers hold an `Arc` to it without any lock.
#[derive(Debug)]
pub struct CacheSnapshot<K, V> {
    items: HashMap<K, V>,
    loaded_at: Instant,
    generation: u64,
}

impl<K, V> CacheSnapshot<K, V>
where
    K: Eq + Hash,
{
    pub(crate) fn new(items: HashMap<K, V>, generation: u64) -> Self {
        Self {
            items,
            loaded_at: Instant::now(),
            generation,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    pub fn items(&self) -> &HashMap<K, V> {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    /// Invalidation generation the snapshot was loaded under.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn age_tracks_tokio_clock() {
        let snapshot = CacheSnapshot::new(HashMap::from([("a", 1)]), 0);
        assert_eq!(snapshot.age(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(42)).await;
        assert_eq!(snapshot.age(), Duration::from_secs(42));
    }

    #[test]
    fn empty_snapshot_is_still_a_snapshot() {
        let snapshot: CacheSnapshot<String, u32> = CacheSnapshot::new(HashMap::new(), 3);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 3);
    }
}
