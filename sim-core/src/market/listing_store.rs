//! §4.4 generic listing store: a keyed map plus uniform-without-replacement
//! sampling over whatever subset matches a predicate. All three marketplaces
//! (item/labor/land) are this same shape with different key/value types and
//! predicates, so the storage and sampling logic lives here once.

use std::collections::HashMap;
use std::hash::Hash;

use rand::seq::SliceRandom;

pub struct ListingStore<K, V> {
    listings: HashMap<K, V>,
}

impl<K, V> Default for ListingStore<K, V> {
    fn default() -> Self {
        Self { listings: HashMap::new() }
    }
}

impl<K, V> ListingStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the listing at `key` (§4.4: "a later update for the
    /// same identity replaces the earlier one").
    pub fn upsert(&mut self, key: K, value: V) {
        self.listings.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.listings.remove(key)
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    /// Every listing currently held, for checkpointing (§6 persisted state).
    pub fn all_values(&self) -> Vec<V> {
        self.listings.values().cloned().collect()
    }

    /// Replace the whole store, re-deriving keys from `key_fn`. Used by
    /// `loadCheckpoint` to restore a marketplace's listings atomically.
    pub fn replace_all(&mut self, values: Vec<V>, key_fn: impl Fn(&V) -> K) {
        self.listings = values.into_iter().map(|v| (key_fn(&v), v)).collect();
    }

    /// Every listing whose value satisfies `predicate`, in arbitrary order.
    pub fn matching(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.listings.values().filter(|v| predicate(v)).cloned().collect()
    }

    /// Uniform sample of up to `sample_size` listings matching `predicate`,
    /// without replacement. If fewer than `sample_size` match, returns all of
    /// them (§4.4 edge case: a thin market is not an error).
    pub fn sample(
        &self,
        predicate: impl Fn(&V) -> bool,
        sample_size: usize,
        rng: &mut impl rand::Rng,
    ) -> Vec<V> {
        let mut candidates = self.matching(predicate);
        candidates.shuffle(rng);
        candidates.truncate(sample_size);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn upsert_replaces_the_same_key() {
        let mut store = ListingStore::new();
        store.upsert("a", 1);
        store.upsert("a", 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.matching(|_| true), vec![2]);
    }

    #[test]
    fn sample_never_exceeds_requested_size_or_available_candidates() {
        let mut store = ListingStore::new();
        for i in 0..3 {
            store.upsert(i, i);
        }
        let mut rng = StdRng::seed_from_u64(7);
        let sampled = store.sample(|_| true, 10, &mut rng);
        assert_eq!(sampled.len(), 3);
        let mut rng = StdRng::seed_from_u64(7);
        let sampled = store.sample(|_| true, 2, &mut rng);
        assert_eq!(sampled.len(), 2);
    }

    #[test]
    fn sample_respects_the_predicate() {
        let mut store = ListingStore::new();
        store.upsert(1, 10);
        store.upsert(2, 20);
        let mut rng = StdRng::seed_from_u64(1);
        let sampled = store.sample(|v| *v > 15, 10, &mut rng);
        assert_eq!(sampled, vec![20]);
    }
}
