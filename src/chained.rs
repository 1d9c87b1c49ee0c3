//! Chaining multimap with independent per-bucket chains.
//!
//! The plainest of the three engines: each bucket heads its own singly
//! linked chain and buckets share nothing. Insert is a constant-time head
//! push with no bookkeeping beyond the entry count, and lookup walks one
//! chain. The price is iteration: visiting every entry means scanning the
//! whole bucket array, including the empty stretches.
//!
//! Supports insert and lookup only, no deletion.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;

use ahash::RandomState;

use crate::policy::{LoadFactor, Percent, MIN_SLOTS, PAGE_SIZE};

/// Default initial bucket count: one page worth of bucket pointers.
const INIT_SLOT_COUNT: usize = PAGE_SIZE / std::mem::size_of::<*mut ()>();

/// Chain entry. Hash and next pointer lead the layout so the chain walk
/// stays in the front of the entry until the hash matches.
struct Entry<K, V> {
    hash: u64,
    next: *mut Entry<K, V>,
    key: K,
    val: V,
}

fn alloc_bucket_array<K, V>(slot_count: usize) -> *mut *mut Entry<K, V> {
    let layout = Layout::array::<*mut Entry<K, V>>(slot_count).unwrap();
    let buckets = unsafe { alloc_zeroed(layout) as *mut *mut Entry<K, V> };
    if buckets.is_null() {
        handle_alloc_error(layout);
    }
    buckets
}

/// Chaining multimap with one chain per bucket.
///
/// Load factors above 100% are the norm here; the default resizes once the
/// table averages four entries per bucket.
pub struct ChainedMultiMap<K, V, S = RandomState, L = Percent<400>> {
    buckets: *mut *mut Entry<K, V>,
    mask: usize,
    slot_count: usize,
    entry_count: usize,
    threshold: usize,
    hasher: S,
    policy: L,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: the table owns the bucket array and every entry; no interior
// mutability.
unsafe impl<K: Send, V: Send, S: Send, L: Send> Send for ChainedMultiMap<K, V, S, L> {}
unsafe impl<K: Sync, V: Sync, S: Sync, L: Sync> Sync for ChainedMultiMap<K, V, S, L> {}

impl<K: Eq + Hash, V> ChainedMultiMap<K, V, RandomState, Percent<400>> {
    /// Create an empty map with the default bucket count.
    pub fn new() -> Self {
        Self::with_slots(INIT_SLOT_COUNT)
    }

    /// Create an empty map with roughly `slot_count` buckets.
    pub fn with_slots(slot_count: usize) -> Self {
        Self::with_slots_and_hasher(slot_count, RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> ChainedMultiMap<K, V, S, Percent<400>> {
    /// Create an empty map with the given bucket count and hasher.
    pub fn with_slots_and_hasher(slot_count: usize, hasher: S) -> Self {
        Self::with_slots_hasher_and_policy(slot_count, hasher, Percent::<400>)
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> ChainedMultiMap<K, V, S, L> {
    /// Create an empty map with the given bucket count, hasher, and
    /// load-factor policy.
    pub fn with_slots_hasher_and_policy(slot_count: usize, hasher: S, policy: L) -> Self {
        let slot_count = slot_count.max(MIN_SLOTS).next_power_of_two();
        let threshold = policy.threshold(slot_count);

        Self {
            buckets: alloc_bucket_array::<K, V>(slot_count),
            mask: slot_count - 1,
            slot_count,
            entry_count: 0,
            threshold,
            hasher,
            policy,
            _marker: PhantomData,
        }
    }

    // ============================================================================================
    // PUBLIC API
    // ============================================================================================

    /// Insert a `(key, value)` pair at the head of its bucket's chain.
    ///
    /// Duplicates are kept: inserting the same key twice stores two
    /// entries.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entry_count == self.threshold {
            self.grow();
            debug_assert!(self.entry_count < self.threshold);
        }

        let hash = self.hasher.hash_one(&key);
        let index = (hash as usize) & self.mask;
        unsafe {
            let bucket = self.buckets.add(index);
            let entry = Box::into_raw(Box::new(Entry {
                hash,
                next: *bucket,
                key,
                val: value,
            }));
            *bucket = entry;
        }
        self.entry_count += 1;
    }

    /// Invoke `f` once per `(key, value)` pair stored under `key`.
    ///
    /// The stored hash is compared before the equality predicate runs, so
    /// an expensive `Eq` is only consulted on hash hits.
    pub fn for_each_value(&self, key: &K, mut f: impl FnMut(&K, &V)) {
        let hash = self.hasher.hash_one(key);
        let index = (hash as usize) & self.mask;
        unsafe {
            let mut cur = *self.buckets.add(index);
            while !cur.is_null() {
                let entry = &*cur;
                if entry.hash == hash && &entry.key == key {
                    f(&entry.key, &entry.val);
                }
                cur = entry.next;
            }
        }
    }

    /// Append every value stored under `key` to `out`.
    pub fn get_values(&self, key: &K, out: &mut Vec<V>)
    where
        V: Clone,
    {
        self.for_each_value(key, |_, v| out.push(v.clone()));
    }

    /// Whether `key` has at least one value.
    pub fn contains_key(&self, key: &K) -> bool {
        let mut found = false;
        self.for_each_value(key, |_, _| found = true);
        found
    }

    /// Iterator over every `(key, value)` pair.
    ///
    /// Scans the bucket array and walks each chain; advancing past a
    /// stretch of empty buckets costs one check per bucket skipped.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            buckets: self.buckets,
            slot_count: self.slot_count,
            index: 0,
            cur: ptr::null(),
            _marker: PhantomData,
        };
        iter.seek_chain();
        iter
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Current bucket count, always a power of two.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Entry count at which the next insert resizes.
    pub fn resize_threshold(&self) -> usize {
        self.threshold
    }

    /// Mean entries per bucket; above 1.0 once chains form.
    pub fn load_factor(&self) -> f64 {
        self.entry_count as f64 / self.slot_count as f64
    }

    // ============================================================================================
    // INTERNALS
    // ============================================================================================

    /// Double the bucket array, unlinking each entry from its old chain
    /// and pushing it onto the head of its new one. Entries are rehomed,
    /// not reallocated.
    fn grow(&mut self) {
        let old_buckets = self.buckets;
        let old_slot_count = self.slot_count;

        self.slot_count <<= 1;
        self.mask = self.slot_count - 1;
        self.threshold = self.policy.threshold(self.slot_count);
        self.buckets = alloc_bucket_array::<K, V>(self.slot_count);

        unsafe {
            for i in 0..old_slot_count {
                let mut entry = *old_buckets.add(i);
                while !entry.is_null() {
                    // The push rewires the next pointer, so save it first.
                    let next = (*entry).next;
                    let index = ((*entry).hash as usize) & self.mask;
                    debug_assert!(index < self.slot_count);

                    let bucket = self.buckets.add(index);
                    (*entry).next = *bucket;
                    *bucket = entry;

                    entry = next;
                }
            }
            dealloc(
                old_buckets as *mut u8,
                Layout::array::<*mut Entry<K, V>>(old_slot_count).unwrap(),
            );
        }
    }
}

impl<K, V, S, L> Drop for ChainedMultiMap<K, V, S, L> {
    fn drop(&mut self) {
        unsafe {
            for i in 0..self.slot_count {
                let mut entry = *self.buckets.add(i);
                while !entry.is_null() {
                    let next = (*entry).next;
                    drop(Box::from_raw(entry));
                    entry = next;
                }
            }
            dealloc(
                self.buckets as *mut u8,
                Layout::array::<*mut Entry<K, V>>(self.slot_count).unwrap(),
            );
        }
    }
}

impl<K: Eq + Hash, V> Default for ChainedMultiMap<K, V, RandomState, Percent<400>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> Extend<(K, V)>
    for ChainedMultiMap<K, V, S, L>
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<'a, K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> IntoIterator
    for &'a ChainedMultiMap<K, V, S, L>
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over `(&K, &V)` pairs of a [`ChainedMultiMap`].
pub struct Iter<'a, K, V> {
    buckets: *const *mut Entry<K, V>,
    slot_count: usize,
    index: usize,
    cur: *const Entry<K, V>,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K, V> Iter<'a, K, V> {
    /// Advance to the head of the next non-empty chain.
    fn seek_chain(&mut self) {
        while self.cur.is_null() && self.index < self.slot_count {
            self.cur = unsafe { *self.buckets.add(self.index) };
            self.index += 1;
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        unsafe {
            let entry = &*self.cur;
            self.cur = entry.next;
            if self.cur.is_null() {
                self.seek_chain();
            }
            Some((&entry.key, &entry.val))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_count_rounds_up_to_a_power_of_two() {
        let map: ChainedMultiMap<u64, u64> = ChainedMultiMap::with_slots(30);
        assert_eq!(map.slot_count(), 32);
        let map: ChainedMultiMap<u64, u64> = ChainedMultiMap::with_slots(1024);
        assert_eq!(map.slot_count(), 1024);
        let map: ChainedMultiMap<u64, u64> = ChainedMultiMap::with_slots(0);
        assert_eq!(map.slot_count(), 32);
    }

    #[test]
    fn resize_rehomes_without_losing_entries() {
        let mut map: ChainedMultiMap<u64, u64> = ChainedMultiMap::with_slots(32);
        // Percent<400> on 32 slots resizes at 128 entries.
        for key in 0..130u64 {
            map.insert(key, key);
        }
        assert_eq!(map.slot_count(), 64);
        assert_eq!(map.len(), 130);
        for key in 0..130u64 {
            let mut out = Vec::new();
            map.get_values(&key, &mut out);
            assert_eq!(out, vec![key]);
        }
    }

    #[test]
    fn iterator_skips_empty_buckets() {
        let mut map: ChainedMultiMap<u64, u64> = ChainedMultiMap::with_slots(256);
        map.insert(1, 10);
        map.insert(2, 20);
        map.insert(3, 30);
        let mut seen: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 10), (2, 20), (3, 30)]);
    }
}
