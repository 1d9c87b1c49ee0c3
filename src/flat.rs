//! Open-addressing multimap with per-key value lists.
//!
//! All keys live inline in one flat slot array and collisions are resolved
//! by linear probing, which keeps lookups cache friendly at the cost of a
//! low load factor. A key's first value is stored inline in its slot; once
//! a key gains a second value, every value for it moves into a single
//! heap-allocated value list, so iterating the values of one key never
//! chases pointers.
//!
//! Trade-offs against the chaining engines in this crate:
//!
//! 1. Inline storage and probing avoid a pointer dereference per lookup,
//!    but the load-factor policy must keep a healthy fraction of slots
//!    free, so more memory is reserved per live entry.
//! 2. The value list makes duplicate-heavy workloads compact, but on
//!    unique-key workloads the promotion machinery is pure overhead.
//!
//! This is the only engine in the crate that supports deletion, both of
//! whole keys and of single values through [`CursorMut`].

use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::{ptr, slice};

use ahash::RandomState;

use crate::policy::{HalfFull, LoadFactor, MIN_SLOTS, PAGE_SIZE};
use crate::raw::RawCell;

// ================================================================================================
// SLOT STATE
// ================================================================================================

// The slot tag shares its word with the value-list pointer. Heap pointers
// returned by the global allocator are always far above the largest tag, so
// "has a value list" is a single comparison against LIST_MIN.
const FREE: usize = 0;
const TOMBSTONE: usize = 1;
const SINGLE: usize = 2;
const LIST_MIN: usize = 3;

const LIST_INITIAL_CAPACITY: u32 = 4;
// Value-list capacity stays a power of two; growing past this bound is
// treated the same as allocation exhaustion.
const LIST_MAX_CAPACITY: u32 = 1 << 31;

/// One slot of the flat array.
///
/// `state` is the tag word: `FREE`, `TOMBSTONE`, `SINGLE`, or the address
/// of the slot's [`ValueList`]. The key cell is initialized iff the slot is
/// live; the value cell is initialized iff the slot is `SINGLE` (with a
/// list, every value lives in the list and none inline).
struct Slot<K, V> {
    state: usize,
    hash: u64,
    key: RawCell<K>,
    val: RawCell<V>,
}

impl<K, V> Slot<K, V> {
    #[inline(always)]
    fn is_free(&self) -> bool {
        self.state == FREE
    }

    #[inline(always)]
    fn is_tombstone(&self) -> bool {
        self.state == TOMBSTONE
    }

    /// Holds a key, either with an inline value or a value list.
    #[inline(always)]
    fn is_live(&self) -> bool {
        self.state >= SINGLE
    }

    #[inline(always)]
    fn has_list(&self) -> bool {
        self.state >= LIST_MIN
    }

    /// Reinterpret the tag word as the value-list address.
    #[inline(always)]
    fn list(&self) -> *mut ValueList<V> {
        debug_assert!(self.has_list());
        self.state as *mut ValueList<V>
    }

    /// Base pointer and length of this slot's value stream.
    ///
    /// # Safety
    ///
    /// The slot must be live.
    #[inline(always)]
    unsafe fn value_stream(&self) -> (*const V, u32) {
        if self.has_list() {
            let list = self.list();
            (ValueList::values(list) as *const V, (*list).len)
        } else {
            (self.val.as_ptr(), 1)
        }
    }

    /// Append a value to a live slot, promoting the inline value into a
    /// fresh list or growing a full list as needed.
    ///
    /// # Safety
    ///
    /// The slot must be live.
    unsafe fn push_value(&mut self, value: V) {
        if self.has_list() {
            let mut list = self.list();
            if (*list).len == (*list).capacity {
                list = self.grow_list();
            }
            ValueList::values(list).add((*list).len as usize).write(value);
            (*list).len += 1;
        } else {
            // Second value for this key: move the inline value into slot 0
            // of a new list and the key stays inline.
            let list = ValueList::<V>::allocate(LIST_INITIAL_CAPACITY);
            let values = ValueList::values(list);
            values.write(self.val.assume_init_read());
            values.add(1).write(value);
            (*list).len = 2;
            self.state = list as usize;
        }
    }

    /// Replace a full list with one of doubled capacity, moving the values
    /// over bitwise.
    ///
    /// # Safety
    ///
    /// The slot must hold a list and the list must be full.
    unsafe fn grow_list(&mut self) -> *mut ValueList<V> {
        let old = self.list();
        let old_capacity = (*old).capacity;
        if old_capacity >= LIST_MAX_CAPACITY {
            handle_alloc_error(ValueList::<V>::layout(old_capacity).0);
        }

        let new = ValueList::<V>::allocate(old_capacity * 2);
        ptr::copy_nonoverlapping(
            ValueList::values(old),
            ValueList::values(new),
            (*old).len as usize,
        );
        (*new).len = (*old).len;
        ValueList::free(old);
        self.state = new as usize;
        new
    }

    /// Destroy the slot's key and values and mark it as a tombstone.
    ///
    /// # Safety
    ///
    /// The slot must be live.
    unsafe fn clear(&mut self) {
        if self.has_list() {
            let list = self.list();
            let values = ValueList::values(list);
            for i in 0..(*list).len as usize {
                ptr::drop_in_place(values.add(i));
            }
            ValueList::free(list);
        } else {
            self.val.assume_init_drop();
        }
        self.key.assume_init_drop();
        self.state = TOMBSTONE;
    }
}

// ================================================================================================
// VALUE LIST
// ================================================================================================

/// Overflow buffer for a key mapped to more than one value.
///
/// Header and payload live in one allocation so a lookup touches a single
/// cache line run: `len` values of type `V` follow the header directly.
#[repr(C)]
struct ValueList<V> {
    len: u32,
    capacity: u32,
    _values: PhantomData<V>,
}

impl<V> ValueList<V> {
    /// Allocation layout for a list of `capacity` values, and the byte
    /// offset of the payload.
    fn layout(capacity: u32) -> (Layout, usize) {
        let header = Layout::new::<ValueList<V>>();
        let payload = Layout::array::<V>(capacity as usize).unwrap();
        let (layout, offset) = header.extend(payload).unwrap();
        (layout.pad_to_align(), offset)
    }

    /// Allocate an empty list of the given capacity.
    unsafe fn allocate(capacity: u32) -> *mut ValueList<V> {
        let (layout, _) = Self::layout(capacity);
        let list = alloc(layout) as *mut ValueList<V>;
        if list.is_null() {
            handle_alloc_error(layout);
        }
        (*list).len = 0;
        (*list).capacity = capacity;
        list
    }

    /// Free the allocation. The values must already be moved out or
    /// dropped.
    unsafe fn free(list: *mut ValueList<V>) {
        let (layout, _) = Self::layout((*list).capacity);
        dealloc(list as *mut u8, layout);
    }

    /// Base pointer of the trailing value array.
    #[inline(always)]
    unsafe fn values(list: *mut ValueList<V>) -> *mut V {
        let (_, offset) = Self::layout((*list).capacity);
        (list as *mut u8).add(offset) as *mut V
    }
}

// ================================================================================================
// TABLE
// ================================================================================================

/// Open-addressing multimap from `K` to one or more `V`.
///
/// `S` supplies the 64-bit hash, `L` the load-factor policy (which must
/// return strictly less than the capacity for this engine). Borrowed
/// lookups ([`get`](Self::get), iterators, cursors) stay valid until the
/// next mutating call; the borrow checker enforces this.
pub struct FlatMultiMap<K, V, S = RandomState, L = HalfFull> {
    // slot_count real slots plus one sentinel, in a single allocation
    slots: *mut Slot<K, V>,
    mask: usize,
    slot_count: usize,
    active: usize,
    threshold: usize,
    hasher: S,
    policy: L,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: the table owns its slots, value lists, keys, and values outright;
// there is no interior mutability, so moving it across threads or sharing
// &self for the read-only API is sound whenever the contents allow it.
unsafe impl<K: Send, V: Send, S: Send, L: Send> Send for FlatMultiMap<K, V, S, L> {}
unsafe impl<K: Sync, V: Sync, S: Sync, L: Sync> Sync for FlatMultiMap<K, V, S, L> {}

/// Initial slot count: the request rounded up to a power of two, at least
/// `MIN_SLOTS`, and at least enough slots to fill one VM page.
fn initial_slot_count<K, V>(requested: usize) -> usize {
    let page_fill = PAGE_SIZE / std::mem::size_of::<Slot<K, V>>();
    requested
        .max(MIN_SLOTS)
        .max(page_fill)
        .next_power_of_two()
}

/// Allocate `slot_count` free slots plus the sentinel.
///
/// Zeroed memory reads as `FREE`, so only the sentinel needs touching: it
/// permanently carries a live tag with no key or value, which lets the
/// iterators stop on it without a bounds check.
fn alloc_slots<K, V>(slot_count: usize) -> *mut Slot<K, V> {
    let layout = Layout::array::<Slot<K, V>>(slot_count + 1).unwrap();
    let slots = unsafe { alloc_zeroed(layout) as *mut Slot<K, V> };
    if slots.is_null() {
        handle_alloc_error(layout);
    }
    unsafe {
        (*slots.add(slot_count)).state = SINGLE;
    }
    slots
}

impl<K: Eq + Hash, V> FlatMultiMap<K, V, RandomState, HalfFull> {
    /// Create an empty map with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty map sized for roughly `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> FlatMultiMap<K, V, S, HalfFull> {
    /// Create an empty map using the provided hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Create an empty map with the given capacity and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self::with_capacity_hasher_and_policy(capacity, hasher, HalfFull)
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> FlatMultiMap<K, V, S, L> {
    /// Create an empty map with the given capacity, hasher, and
    /// load-factor policy.
    pub fn with_capacity_hasher_and_policy(capacity: usize, hasher: S, policy: L) -> Self {
        let slot_count = initial_slot_count::<K, V>(capacity);
        let threshold = policy.threshold(slot_count);
        debug_assert!(threshold < slot_count);

        Self {
            slots: alloc_slots(slot_count),
            mask: slot_count - 1,
            slot_count,
            active: 0,
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
    /// A repeated key appends the value to the key's value stream; only a
    /// new key can trigger a resize.
    pub fn insert(&mut self, key: K, value: V) {
        let hash = self.hasher.hash_one(&key);
        let mut vacant: *mut Slot<K, V> = ptr::null_mut();
        let mut idx = (hash as usize) & self.mask;

        // Probe until a free slot ends the run, remembering the first
        // reusable slot (free or tombstone) seen along the way.
        let mut target = loop {
            let slot = unsafe { self.slots.add(idx) };
            let s = unsafe { &*slot };
            if s.is_free() {
                break if vacant.is_null() { slot } else { vacant };
            }
            if s.is_tombstone() {
                if vacant.is_null() {
                    vacant = slot;
                }
            } else if s.hash == hash && unsafe { s.key.assume_init_ref() } == &key {
                unsafe { (*slot).push_value(value) };
                return;
            }
            idx = (idx + 1) & self.mask;
        };

        if self.active == self.threshold {
            self.grow();
            target = self.probe_vacant(hash);
        }

        unsafe {
            let s = &mut *target;
            s.state = SINGLE;
            s.hash = hash;
            s.key.write(key);
            s.val.write(value);
        }
        self.active += 1;
    }

    /// All values stored under `key`, as a borrowed slice.
    ///
    /// Returns `None` for an absent key; a present key always yields a
    /// non-empty slice (one element for an inline value, the whole value
    /// list otherwise).
    pub fn get(&self, key: &K) -> Option<&[V]> {
        let hash = self.hasher.hash_one(key);
        let slot = self.find_slot(hash, key)?;
        unsafe {
            let (values, len) = (*slot).value_stream();
            Some(slice::from_raw_parts(values, len as usize))
        }
    }

    /// The first value stored under `key`.
    pub fn get_first(&self, key: &K) -> Option<&V> {
        self.get(key).and_then(|values| values.first())
    }

    /// Whether `key` has at least one value.
    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        self.find_slot(hash, key).is_some()
    }

    /// Invoke `f` once per `(key, value)` pair stored under `key`.
    pub fn for_each_value(&self, key: &K, mut f: impl FnMut(&K, &V)) {
        let hash = self.hasher.hash_one(key);
        if let Some(slot) = self.find_slot(hash, key) {
            unsafe {
                let stored_key = (*slot).key.assume_init_ref();
                let (values, len) = (*slot).value_stream();
                for i in 0..len as usize {
                    f(stored_key, &*values.add(i));
                }
            }
        }
    }

    /// Append every value stored under `key` to `out`.
    pub fn get_values(&self, key: &K, out: &mut Vec<V>)
    where
        V: Clone,
    {
        if let Some(values) = self.get(key) {
            out.extend_from_slice(values);
        }
    }

    /// Iterator over the values of one key, pinned to that key's slot.
    pub fn values_of(&self, key: &K) -> slice::Iter<'_, V> {
        self.get(key).unwrap_or(&[]).iter()
    }

    /// Remove `key` and every value stored under it.
    ///
    /// Returns whether the key was present. The slot becomes a tombstone:
    /// later lookups probe past it, later inserts may reuse it.
    pub fn remove_key(&mut self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        match self.find_slot(hash, key) {
            None => false,
            Some(slot) => {
                unsafe { (*slot).clear() };
                self.active -= 1;
                true
            }
        }
    }

    /// Iterator over every `(key, value)` pair.
    ///
    /// Keys with several values are yielded once per value, consecutively.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            slot: self.slots,
            sentinel: self.sentinel(),
            value: ptr::null(),
            remaining: 0,
            _marker: PhantomData,
        };
        unsafe { iter.seek_live() };
        iter
    }

    /// Like [`iter`](Self::iter), with mutable access to the values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        let mut iter = IterMut {
            slot: self.slots,
            sentinel: self.sentinel(),
            value: ptr::null_mut(),
            remaining: 0,
            _marker: PhantomData,
        };
        unsafe { iter.seek_live() };
        iter
    }

    /// Mutable cursor over the whole table, supporting in-place value
    /// mutation and single-value removal.
    pub fn cursor_mut(&mut self) -> CursorMut<'_, K, V, S, L> {
        let slots = self.slots;
        let mut cursor = CursorMut {
            map: self,
            slot: slots,
            value: ptr::null_mut(),
            remaining: 0,
            pinned: false,
        };
        unsafe { cursor.seek_live() };
        cursor
    }

    /// Mutable cursor pinned to `key`'s slot; it traverses only that key's
    /// values and is exhausted once they are gone.
    pub fn cursor_key_mut(&mut self, key: &K) -> CursorMut<'_, K, V, S, L> {
        let hash = self.hasher.hash_one(key);
        let found = self.find_slot(hash, key);
        let sentinel = self.sentinel();
        match found {
            Some(slot) => unsafe {
                let (values, len) = (*slot).value_stream();
                CursorMut {
                    map: self,
                    slot,
                    value: values as *mut V,
                    remaining: len,
                    pinned: true,
                }
            },
            None => CursorMut {
                map: self,
                slot: sentinel,
                value: ptr::null_mut(),
                remaining: 0,
                pinned: true,
            },
        }
    }

    // ============================================================================================
    // DIAGNOSTICS
    // ============================================================================================

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.active
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Current slot count, always a power of two.
    pub fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Live-key count at which the next new-key insert resizes.
    pub fn resize_threshold(&self) -> usize {
        self.threshold
    }

    /// Fraction of slots holding a live key.
    pub fn load_factor(&self) -> f64 {
        self.active as f64 / self.slot_count as f64
    }

    /// Probe and run statistics over the current slot array.
    ///
    /// One linear scan; diagnostic only, not on any fast path. The probe
    /// length of a start position counts the slots a missing-key lookup
    /// beginning there would inspect, including the free slot that ends
    /// it; a run is a maximal stretch of non-free slots (probing wraps, so
    /// a run touching the array end joins one starting at index zero).
    pub fn probe_stats(&self) -> ProbeStats {
        let n = self.slot_count;
        let mut runs: Vec<usize> = Vec::new();
        let mut current = 0usize;
        for i in 0..n {
            let s = unsafe { &*self.slots.add(i) };
            if s.is_free() {
                if current > 0 {
                    runs.push(current);
                    current = 0;
                }
            } else {
                current += 1;
            }
        }
        if current > 0 {
            let wraps_into_first_run =
                !runs.is_empty() && unsafe { !(*self.slots).is_free() };
            if wraps_into_first_run {
                runs[0] += current;
            } else {
                runs.push(current);
            }
        }

        let occupied: usize = runs.iter().sum();
        let free = n - occupied;

        let mut sum_probe = free as u128;
        let mut sum_probe_sq = free as u128;
        for &r in &runs {
            let r = r as u128;
            // Start offsets 0..r probe r+1, r, ..., 2 slots respectively.
            sum_probe += (r + 1) * (r + 2) / 2 - 1;
            sum_probe_sq += (r + 1) * (r + 2) * (2 * r + 3) / 6 - 1;
        }

        let max_run = runs.iter().copied().max().unwrap_or(0);
        let mean_run = if runs.is_empty() {
            0.0
        } else {
            occupied as f64 / runs.len() as f64
        };
        let mean_probe = sum_probe as f64 / n as f64;
        let variance = sum_probe_sq as f64 / n as f64 - mean_probe * mean_probe;

        ProbeStats {
            max_probe: max_run + 1,
            mean_probe,
            std_dev_probe: variance.max(0.0).sqrt(),
            max_run,
            mean_run,
        }
    }

    // ============================================================================================
    // INTERNALS
    // ============================================================================================

    #[inline(always)]
    fn sentinel(&self) -> *mut Slot<K, V> {
        unsafe { self.slots.add(self.slot_count) }
    }

    /// Probe for `key`, stopping at the first free slot. Tombstones are
    /// skipped and never end the search.
    #[inline]
    fn find_slot(&self, hash: u64, key: &K) -> Option<*mut Slot<K, V>> {
        let mut idx = (hash as usize) & self.mask;
        loop {
            let slot = unsafe { self.slots.add(idx) };
            let s = unsafe { &*slot };
            if s.is_free() {
                return None;
            }
            if !s.is_tombstone() && s.hash == hash && unsafe { s.key.assume_init_ref() } == key {
                return Some(slot);
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// First free slot in `hash`'s probe run. Only valid on a freshly
    /// grown table, which contains no tombstones.
    fn probe_vacant(&self, hash: u64) -> *mut Slot<K, V> {
        let mut idx = (hash as usize) & self.mask;
        loop {
            let slot = unsafe { self.slots.add(idx) };
            if unsafe { (*slot).is_free() } {
                return slot;
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// Double the slot array and relocate every live slot by its stored
    /// hash. Slot contents move bitwise; keys and values are not touched.
    fn grow(&mut self) {
        let new_count = self.slot_count << 1;
        let new_mask = new_count - 1;
        let new_slots = alloc_slots::<K, V>(new_count);

        // Stop the walk once every live slot has been moved.
        let mut remaining = self.active;
        let mut slot = self.slots;
        while remaining > 0 {
            unsafe {
                if (*slot).is_live() {
                    remaining -= 1;
                    let mut idx = ((*slot).hash as usize) & new_mask;
                    loop {
                        let dst = new_slots.add(idx);
                        if (*dst).is_free() {
                            ptr::copy_nonoverlapping(slot, dst, 1);
                            break;
                        }
                        idx = (idx + 1) & new_mask;
                    }
                }
                slot = slot.add(1);
            }
        }

        unsafe {
            dealloc(
                self.slots as *mut u8,
                Layout::array::<Slot<K, V>>(self.slot_count + 1).unwrap(),
            );
        }
        self.slots = new_slots;
        self.slot_count = new_count;
        self.mask = new_mask;
        self.threshold = self.policy.threshold(new_count);
        debug_assert!(self.active < self.threshold);
    }
}

impl<K, V, S, L> Drop for FlatMultiMap<K, V, S, L> {
    fn drop(&mut self) {
        let mut remaining = self.active;
        let mut slot = self.slots;
        while remaining > 0 {
            unsafe {
                if (*slot).is_live() {
                    remaining -= 1;
                    (*slot).clear();
                }
                slot = slot.add(1);
            }
        }
        unsafe {
            dealloc(
                self.slots as *mut u8,
                Layout::array::<Slot<K, V>>(self.slot_count + 1).unwrap(),
            );
        }
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K: Eq + Hash, V, S: BuildHasher + Default, L: LoadFactor + Default> Default
    for FlatMultiMap<K, V, S, L>
{
    fn default() -> Self {
        Self::with_capacity_hasher_and_policy(0, S::default(), L::default())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> Extend<(K, V)> for FlatMultiMap<K, V, S, L> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K: Eq + Hash, V, S: BuildHasher + Default, L: LoadFactor + Default> FromIterator<(K, V)>
    for FlatMultiMap<K, V, S, L>
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

impl<'a, K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> IntoIterator
    for &'a FlatMultiMap<K, V, S, L>
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ================================================================================================
// DIAGNOSTIC STATISTICS
// ================================================================================================

/// Probe and run statistics for a [`FlatMultiMap`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeStats {
    /// Most slots any missing-key lookup inspects.
    pub max_probe: usize,
    /// Mean slots inspected over every possible start position.
    pub mean_probe: f64,
    /// Standard deviation of the probe length.
    pub std_dev_probe: f64,
    /// Longest stretch of consecutive non-free slots.
    pub max_run: usize,
    /// Mean length of the non-free stretches.
    pub mean_run: f64,
}

// ================================================================================================
// ITERATORS
// ================================================================================================

/// Iterator over `(&K, &V)` pairs of a [`FlatMultiMap`].
///
/// Carries a slot cursor plus a cursor into the current slot's value
/// stream; it terminates on the sentinel slot past the end of the array.
pub struct Iter<'a, K, V> {
    slot: *const Slot<K, V>,
    sentinel: *const Slot<K, V>,
    value: *const V,
    remaining: u32,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K, V> Iter<'a, K, V> {
    /// Advance the slot cursor to the next live slot (or the sentinel) and
    /// load its value stream.
    unsafe fn seek_live(&mut self) {
        while self.slot != self.sentinel && !(*self.slot).is_live() {
            self.slot = self.slot.add(1);
        }
        if self.slot != self.sentinel {
            let (values, len) = (*self.slot).value_stream();
            self.value = values;
            self.remaining = len;
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot == self.sentinel {
            return None;
        }
        unsafe {
            let key = &*(*self.slot).key.as_ptr();
            let value = &*self.value;
            self.remaining -= 1;
            if self.remaining > 0 {
                self.value = self.value.add(1);
            } else {
                self.slot = self.slot.add(1);
                self.seek_live();
            }
            Some((key, value))
        }
    }
}

/// Iterator over `(&K, &mut V)` pairs of a [`FlatMultiMap`].
pub struct IterMut<'a, K, V> {
    slot: *mut Slot<K, V>,
    sentinel: *mut Slot<K, V>,
    value: *mut V,
    remaining: u32,
    _marker: PhantomData<(&'a K, &'a mut V)>,
}

impl<'a, K, V> IterMut<'a, K, V> {
    unsafe fn seek_live(&mut self) {
        while self.slot != self.sentinel && !(*self.slot).is_live() {
            self.slot = self.slot.add(1);
        }
        if self.slot != self.sentinel {
            let (values, len) = (*self.slot).value_stream();
            self.value = values as *mut V;
            self.remaining = len;
        }
    }
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot == self.sentinel {
            return None;
        }
        unsafe {
            let key = &*(*self.slot).key.as_ptr();
            let value = &mut *self.value;
            self.remaining -= 1;
            if self.remaining > 0 {
                self.value = self.value.add(1);
            } else {
                self.slot = self.slot.add(1);
                self.seek_live();
            }
            Some((key, value))
        }
    }
}

// ================================================================================================
// MUTABLE CURSOR
// ================================================================================================

/// Mutable position in a [`FlatMultiMap`], on one value of one key.
///
/// Unlike the iterators, a cursor can remove the value it stands on:
/// removing a value from a list of two collapses the survivor back to the
/// inline representation, and removing a key's last value turns the slot
/// into a tombstone. After a removal the cursor stands on the next value.
///
/// A cursor from [`cursor_key_mut`](FlatMultiMap::cursor_key_mut) is
/// pinned to its key's slot and exhausts once that slot's values are gone;
/// one from [`cursor_mut`](FlatMultiMap::cursor_mut) continues to the next
/// live slot.
pub struct CursorMut<'a, K, V, S = RandomState, L = HalfFull> {
    map: &'a mut FlatMultiMap<K, V, S, L>,
    slot: *mut Slot<K, V>,
    value: *mut V,
    remaining: u32,
    pinned: bool,
}

impl<'a, K: Eq + Hash, V, S: BuildHasher, L: LoadFactor> CursorMut<'a, K, V, S, L> {
    /// Whether the cursor has moved past every value it covers.
    pub fn is_exhausted(&self) -> bool {
        self.slot == self.map.sentinel()
    }

    /// Key of the current position.
    pub fn key(&self) -> Option<&K> {
        if self.is_exhausted() {
            return None;
        }
        Some(unsafe { (*self.slot).key.assume_init_ref() })
    }

    /// Value at the current position.
    pub fn value(&self) -> Option<&V> {
        if self.is_exhausted() {
            return None;
        }
        Some(unsafe { &*self.value })
    }

    /// Mutable value at the current position.
    pub fn value_mut(&mut self) -> Option<&mut V> {
        if self.is_exhausted() {
            return None;
        }
        Some(unsafe { &mut *self.value })
    }

    /// Move to the next value; no-op when exhausted.
    pub fn advance(&mut self) {
        if self.is_exhausted() {
            return;
        }
        self.remaining -= 1;
        if self.remaining > 0 {
            self.value = unsafe { self.value.add(1) };
        } else {
            unsafe { self.step_slot() };
        }
    }

    /// Remove the value at the current position and advance.
    ///
    /// Returns `None` when the cursor is exhausted.
    pub fn remove_value(&mut self) -> Option<V> {
        if self.is_exhausted() {
            return None;
        }
        unsafe {
            let s = &mut *self.slot;
            if s.has_list() {
                let list = s.list();
                let len = (*list).len;
                let values = ValueList::values(list);
                let pos = (len - self.remaining) as usize;

                let removed = values.add(pos).read();
                // Close the gap: shift the tail down one position.
                ptr::copy(values.add(pos + 1), values.add(pos), len as usize - 1 - pos);
                (*list).len = len - 1;
                self.remaining -= 1;

                if (*list).len == 1 {
                    // One value left: back to the inline representation.
                    let survivor = values.read();
                    ValueList::free(list);
                    s.state = SINGLE;
                    s.val.write(survivor);
                    if self.remaining == 1 {
                        self.value = s.val.as_mut_ptr();
                    }
                }
                if self.remaining == 0 {
                    self.step_slot();
                }
                Some(removed)
            } else {
                // Last value of the key: the whole slot goes.
                let removed = s.val.assume_init_read();
                s.key.assume_init_drop();
                s.state = TOMBSTONE;
                self.map.active -= 1;
                self.remaining = 0;
                self.step_slot();
                Some(removed)
            }
        }
    }

    /// Leave the current slot: pinned cursors exhaust, table cursors move
    /// to the next live slot.
    unsafe fn step_slot(&mut self) {
        if self.pinned {
            self.slot = self.map.sentinel();
            return;
        }
        self.slot = self.slot.add(1);
        self.seek_live();
    }

    unsafe fn seek_live(&mut self) {
        let sentinel = self.map.sentinel();
        while self.slot != sentinel && !(*self.slot).is_live() {
            self.slot = self.slot.add(1);
        }
        if self.slot != sentinel {
            let (values, len) = (*self.slot).value_stream();
            self.value = values as *mut V;
            self.remaining = len;
        }
    }
}

// ================================================================================================
// UNIT TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ZeroState;

    #[test]
    fn initial_capacity_is_clamped_and_rounded() {
        // Slot<u64, u64> is 32 bytes, so one page holds 128 slots.
        assert_eq!(initial_slot_count::<u64, u64>(0), 128);
        assert_eq!(initial_slot_count::<u64, u64>(2), 128);
        assert_eq!(initial_slot_count::<u64, u64>(1000), 1024);
        assert_eq!(initial_slot_count::<u64, u64>(1024), 1024);
        // Large slots fall back to the entry-count floor.
        assert_eq!(initial_slot_count::<u64, [u8; 512]>(0), 32);
    }

    #[test]
    fn stored_hash_matches_key_hash_for_live_slots() {
        let mut map: FlatMultiMap<u64, u64> = FlatMultiMap::new();
        for i in 0..200 {
            map.insert(i, i);
        }
        unsafe {
            for i in 0..map.slot_count {
                let s = &*map.slots.add(i);
                if s.is_live() {
                    let key = s.key.assume_init_ref();
                    assert_eq!(s.hash, map.hasher.hash_one(key));
                }
            }
        }
    }

    #[test]
    fn value_list_grows_by_doubling_from_four() {
        let mut map: FlatMultiMap<u64, u64, ZeroState> =
            FlatMultiMap::with_capacity_and_hasher(0, ZeroState);
        for i in 0..2 {
            map.insert(7, i);
        }
        unsafe {
            let slot = map.find_slot(0, &7).unwrap();
            assert_eq!((*(*slot).list()).capacity, 4);
        }
        for i in 2..5 {
            map.insert(7, i);
        }
        unsafe {
            let slot = map.find_slot(0, &7).unwrap();
            assert_eq!((*(*slot).list()).capacity, 8);
            assert_eq!((*(*slot).list()).len, 5);
        }
        for i in 5..9 {
            map.insert(7, i);
        }
        unsafe {
            let slot = map.find_slot(0, &7).unwrap();
            assert_eq!((*(*slot).list()).capacity, 16);
        }
    }

    #[test]
    fn sentinel_keeps_terminal_tag_across_growth() {
        let mut map: FlatMultiMap<u64, u64> = FlatMultiMap::new();
        unsafe {
            assert_eq!((*map.sentinel()).state, SINGLE);
        }
        for i in 0..500 {
            map.insert(i, i);
        }
        assert!(map.capacity() > 128);
        unsafe {
            assert_eq!((*map.sentinel()).state, SINGLE);
        }
    }

    #[test]
    fn probe_stats_on_a_known_layout() {
        // Zero hasher: n keys occupy slots 0..n, one run of length n.
        let mut map: FlatMultiMap<u64, u64, ZeroState> =
            FlatMultiMap::with_capacity_and_hasher(0, ZeroState);
        for i in 0..4 {
            map.insert(i, i);
        }
        let stats = map.probe_stats();
        assert_eq!(stats.max_run, 4);
        assert_eq!(stats.mean_run, 4.0);
        assert_eq!(stats.max_probe, 5);
        // 124 free starts probe one slot; starts inside the run probe
        // 5, 4, 3, 2 slots.
        let expected_mean = (124.0 + 5.0 + 4.0 + 3.0 + 2.0) / 128.0;
        assert!((stats.mean_probe - expected_mean).abs() < 1e-9);
    }
}
