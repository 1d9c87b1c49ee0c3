//! hashdex: engine-selectable single-threaded multimap hash index.
//!
//! A mapping from keys to one or more values, built as a database index
//! primitive: bulk insertion, point lookup, per-key value iteration, and
//! (where the engine supports it) deletion. Three engines share that outer
//! contract and differ only in storage layout, so the choice can be
//! benchmarked against the workload mix (duplicate-heavy keys, read-heavy
//! phases, large payloads):
//!
//! - [`FlatMultiMap`]: open addressing with linear probing. Keys live
//!   inline in one flat array; a key's values live inline (one) or in a
//!   single heap value list (several). Cache friendly, supports deletion,
//!   needs a low load factor.
//! - [`ThreadedMultiMap`]: chaining, with every entry threaded onto one
//!   global list so full-table iteration is one pointer step per entry.
//!   Insert and lookup only.
//! - [`ChainedMultiMap`]: chaining with independent per-bucket chains.
//!   The simplest insert path; iteration scans the bucket array. Insert
//!   and lookup only.
//!
//! All engines hash through a [`BuildHasher`](std::hash::BuildHasher)
//! (default [`RandomState`] from `ahash`) and size themselves through a
//! [`LoadFactor`] policy. Bucket counts are always powers of two, so slot
//! selection is a mask, never a division.
//!
//! Single-threaded by design: operations take `&self`/`&mut self` and
//! never block or yield. Borrowed lookups and iterators stay valid until
//! the next mutating call, which the borrow checker enforces.
//!
//! ```
//! use hashdex::FlatMultiMap;
//!
//! let mut index: FlatMultiMap<u64, &str> = FlatMultiMap::new();
//! index.insert(7, "a");
//! index.insert(7, "b");
//! assert_eq!(index.get(&7), Some(&["a", "b"][..]));
//! assert!(index.remove_key(&7));
//! assert_eq!(index.get(&7), None);
//! ```

pub mod chained;
pub mod flat;
pub mod policy;
pub mod raw;
pub mod threaded;

pub use ahash::RandomState;

pub use chained::ChainedMultiMap;
pub use flat::{CursorMut, FlatMultiMap, ProbeStats};
pub use policy::{HalfFull, LoadFactor, Mix64State, Percent, ThreeQuartersFull, ZeroState};
pub use threaded::ThreadedMultiMap;
