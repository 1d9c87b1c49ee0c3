//! Chaining multimap threaded through one global entry list.
//!
//! Every entry in the table lives on a single singly linked list headed by
//! a heap-allocated dummy node, and entries that share a home bucket are
//! kept adjacent on that list. A bucket slot does not point at its first
//! entry but at the entry *preceding* its run (possibly the dummy), which
//! is what lets an insert at the global head fix up exactly one other
//! bucket pointer instead of searching for it.
//!
//! The payoff is full-table iteration in constant time per step, without
//! scanning empty buckets; the cost is the trickier insert protocol. The
//! engine supports insert and lookup only, no deletion.
//!
//! Invariants maintained across every insert and resize:
//!
//! 1. For each non-null bucket slot `b`, `bucket[b].next` is the first
//!    entry whose home bucket is `b`, and the rest of `b`'s entries follow
//!    it immediately.
//! 2. The dummy head's successor is the first live entry of the whole
//!    table, or null when the table is empty.
//! 3. The global list's length equals the live entry count.

use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;

use ahash::RandomState;

use crate::policy::{LoadFactor, Percent, MIN_SLOTS, PAGE_SIZE};
use crate::raw::RawCell;

/// Default initial bucket count: one page worth of bucket pointers.
const INIT_SLOT_COUNT: usize = PAGE_SIZE / std::mem::size_of::<*mut ()>();

/// Entry on the global list.
///
/// Hash and next pointer lead the layout so the lookup walk touches the
/// front of the entry before deciding whether to compare keys. Key and
/// value cells are initialized for every entry except the dummy head.
struct Entry<K, V> {
    hash: u64,
    next: *mut Entry<K, V>,
    key: RawCell<K>,
    val: RawCell<V>,
}

impl<K, V> Entry<K, V> {
    fn allocate(hash: u64, key: K, val: V) -> *mut Entry<K, V> {
        let layout = Layout::new::<Entry<K, V>>();
        unsafe {
            let entry = alloc(layout) as *mut Entry<K, V>;
            if entry.is_null() {
                handle_alloc_error(layout);
            }
            entry.write(Entry {
                hash,
                next: ptr::null_mut(),
                key: RawCell::new(key),
                val: RawCell::new(val),
            });
            entry
        }
    }

    fn allocate_dummy() -> *mut Entry<K, V> {
        let layout = Layout::new::<Entry<K, V>>();
        unsafe {
            let entry = alloc(layout) as *mut Entry<K, V>;
            if entry.is_null() {
                handle_alloc_error(layout);
            }
            entry.write(Entry {
                hash: 0,
                next: ptr::null_mut(),
                key: RawCell::uninit(),
                val: RawCell::uninit(),
            });
            entry
        }
    }

    unsafe fn free(entry: *mut Entry<K, V>) {
        dealloc(entry as *mut u8, Layout::new::<Entry<K, V>>());
    }
}

fn alloc_bucket_array<K, V>(slot_count: usize) -> *mut *mut Entry<K, V> {
    let layout = Layout::array::<*mut Entry<K, V>>(slot_count).unwrap();
    let buckets = unsafe { alloc_zeroed(layout) as *mut *mut Entry<K, V> };
    if buckets.is_null() {
        handle_alloc_error(layout);
    }
    buckets
}

/// Chaining multimap with one globally threaded entry list.
///
/// Load factors above 100% are the norm here; the default resizes once the
/// table averages four entries per bucket.
pub struct ThreadedMultiMap<K, V, S = RandomState, L = Percent<400>> {
    buckets: *mut *mut Entry<K, V>,
    dummy: *mut Entry<K, V>,
    mask: usize,
    slot_count: usize,
    entry_count: usize,
    threshold: usize,
    hasher: S,
    policy: L,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: the table owns the bucket array, the dummy, and every entry; no
// interior mutability.
unsafe impl<K: Send, V: Send, S: Send, L: Send> Send for ThreadedMultiMap<K, V, S, L> {}
unsafe impl<K: Sync, V: Sync, S: Sync, L: Sync> Sync for ThreadedMultiMap<K, V, S, L> {}

impl<K: Eq + Hash, V> ThreadedMultiMap<K, V, RandomState, Percent<400>> {
    /// Create an empty map with the default bucket count.
    pub fn new() -> Self {
        Self::with_slots(INIT_SLOT_COUNT)
    }

    /// Create an empty map with roughly `slot_count` buckets.
    pub fn with_slots(slot_count: usize) -> Self {
        Self::with_slots_and_hasher(slot_count, RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> ThreadedMultiMap<K, V, S, Percent<400>> {
    /// Create an empty map with the given bucket count and hasher.
    pub fn with_slots_and_hasher(slot_count: usize, hasher: S) -> Self {
        Self::with_slots_hasher_and_policy(slot_count, hasher, Percent::<400>)
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> ThreadedMultiMap<K, V, S, L> {
    /// Create an empty map with the given bucket count, hasher, and
    /// load-factor policy.
    pub fn with_slots_hasher_and_policy(slot_count: usize, hasher: S, policy: L) -> Self {
        let slot_count = slot_count.max(MIN_SLOTS).next_power_of_two();
        let threshold = policy.threshold(slot_count);

        Self {
            buckets: alloc_bucket_array::<K, V>(slot_count),
            dummy: Entry::allocate_dummy(),
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

    /// Insert a `(key, value)` pair.
    ///
    /// Duplicates are kept: inserting the same key twice stores two
    /// entries. Existing iterators are not invalidated by an insert that
    /// does not resize.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entry_count == self.threshold {
            self.grow();
            debug_assert!(self.entry_count < self.threshold);
        }

        let hash = self.hasher.hash_one(&key);
        let index = (hash as usize) & self.mask;
        let entry = Entry::allocate(hash, key, value);
        unsafe { self.thread_into_slot(entry, index) };
        self.entry_count += 1;
    }

    /// Invoke `f` once per `(key, value)` pair stored under `key`.
    ///
    /// Walks only the bucket's contiguous run of the global list, not the
    /// whole table.
    pub fn for_each_value(&self, key: &K, mut f: impl FnMut(&K, &V)) {
        let hash = self.hasher.hash_one(key);
        let index = (hash as usize) & self.mask;
        unsafe {
            let pred = *self.buckets.add(index);
            if pred.is_null() {
                return;
            }
            let mut cur = (*pred).next;
            while !cur.is_null() {
                let entry = &*cur;
                if ((entry.hash as usize) & self.mask) != index {
                    // The contiguous run for this bucket has ended.
                    break;
                }
                if entry.hash == hash && entry.key.assume_init_ref() == key {
                    f(entry.key.assume_init_ref(), entry.val.assume_init_ref());
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

    /// Iterator over every `(key, value)` pair, in global list order.
    ///
    /// Each step follows one pointer; empty buckets are never visited.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cur: unsafe { (*self.dummy).next },
            _marker: PhantomData,
        }
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

    /// Link `entry` into the global list as the first entry of bucket
    /// `index`'s run. Does not touch the entry count; the resize path
    /// re-threads existing entries through here.
    unsafe fn thread_into_slot(&mut self, entry: *mut Entry<K, V>, index: usize) {
        debug_assert!(index < self.slot_count);

        let pred = *self.buckets.add(index);
        if pred.is_null() {
            // Empty bucket: the new entry opens its run at the global
            // head, right behind the dummy.
            let old_first = (*self.dummy).next;
            (*entry).next = old_first;
            if !old_first.is_null() {
                // The pushed-back entry heads its own bucket's run, whose
                // recorded predecessor was the dummy; it is now this entry.
                let first_index = ((*old_first).hash as usize) & self.mask;
                debug_assert_eq!(*self.buckets.add(first_index), self.dummy);
                *self.buckets.add(first_index) = entry;
            }
            (*self.dummy).next = entry;
            *self.buckets.add(index) = self.dummy;
        } else {
            // Non-empty bucket: the entry becomes the new first of the
            // run; the recorded predecessor stays valid.
            (*entry).next = (*pred).next;
            (*pred).next = entry;
        }
    }

    /// Double the bucket array and re-thread every entry against the new
    /// mask. Entries are rehomed, not reallocated.
    fn grow(&mut self) {
        unsafe {
            // The walk below uses only the global list, so the old array
            // can go first.
            dealloc(
                self.buckets as *mut u8,
                Layout::array::<*mut Entry<K, V>>(self.slot_count).unwrap(),
            );
            self.slot_count <<= 1;
            self.mask = self.slot_count - 1;
            self.threshold = self.policy.threshold(self.slot_count);
            self.buckets = alloc_bucket_array::<K, V>(self.slot_count);

            let mut entry = (*self.dummy).next;
            (*self.dummy).next = ptr::null_mut();
            while !entry.is_null() {
                // Re-threading rewires the next pointer, so save it first.
                let next = (*entry).next;
                let index = ((*entry).hash as usize) & self.mask;
                self.thread_into_slot(entry, index);
                entry = next;
            }
        }
    }
}

impl<K, V, S, L> Drop for ThreadedMultiMap<K, V, S, L> {
    fn drop(&mut self) {
        unsafe {
            // One list walk frees everything; no per-bucket traversal.
            let mut entry = (*self.dummy).next;
            while !entry.is_null() {
                let next = (*entry).next;
                (*entry).key.assume_init_drop();
                (*entry).val.assume_init_drop();
                Entry::free(entry);
                entry = next;
            }
            // The dummy never held a key or value.
            Entry::free(self.dummy);
            dealloc(
                self.buckets as *mut u8,
                Layout::array::<*mut Entry<K, V>>(self.slot_count).unwrap(),
            );
        }
    }
}

impl<K: Eq + Hash, V> Default for ThreadedMultiMap<K, V, RandomState, Percent<400>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> Extend<(K, V)>
    for ThreadedMultiMap<K, V, S, L>
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<'a, K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> IntoIterator
    for &'a ThreadedMultiMap<K, V, S, L>
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over `(&K, &V)` pairs of a [`ThreadedMultiMap`].
pub struct Iter<'a, K, V> {
    cur: *const Entry<K, V>,
    _marker: PhantomData<(&'a K, &'a V)>,
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
            Some((entry.key.assume_init_ref(), entry.val.assume_init_ref()))
        }
    }
}
