use hashdex::{Mix64State, ThreadedMultiMap, ZeroState};

/// Fixed-size payload standing in for a small index record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Blob([u8; 64]);

impl Blob {
    fn new(seed: u8) -> Self {
        Blob([seed; 64])
    }
}

#[test]
fn bulk_insert_then_repeated_read_passes() {
    let mut map: ThreadedMultiMap<u64, Blob, Mix64State> =
        ThreadedMultiMap::with_slots_and_hasher(1024, Mix64State);

    let keys = 100_000u64;
    for i in 0..keys {
        map.insert(i, Blob::new((i % 251) as u8));
    }
    assert_eq!(map.len(), keys as usize);

    let mut out = Vec::new();
    for _pass in 0..3 {
        for i in 0..keys {
            out.clear();
            map.get_values(&i, &mut out);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0], Blob::new((i % 251) as u8));
        }
    }
}

#[test]
fn single_chain_under_zero_hash_still_resolves_keys() {
    let mut map: ThreadedMultiMap<u64, u64, ZeroState> =
        ThreadedMultiMap::with_slots_hasher_and_policy(32, ZeroState, hashdex::Percent::<400>);

    for i in 0..40u64 {
        map.insert(i, i * 10);
    }
    assert_eq!(map.len(), 40);

    for i in 0..40u64 {
        let mut out = Vec::new();
        map.get_values(&i, &mut out);
        assert_eq!(out, vec![i * 10]);
    }
    let mut out = Vec::new();
    map.get_values(&999, &mut out);
    assert!(out.is_empty());
}

#[test]
fn duplicate_keys_accumulate_values() {
    let mut map: ThreadedMultiMap<u64, u64> = ThreadedMultiMap::new();
    for v in 0..5u64 {
        map.insert(77, v);
    }
    map.insert(78, 100);

    let mut out = Vec::new();
    map.get_values(&77, &mut out);
    out.sort_unstable();
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
    assert!(map.contains_key(&78));
    assert_eq!(map.len(), 6);
}

#[test]
fn iteration_walks_the_global_list_exactly_once_per_entry() {
    let mut map: ThreadedMultiMap<u64, u64> = ThreadedMultiMap::with_slots(64);
    for i in 0..300u64 {
        map.insert(i, i + 1);
    }

    let mut seen: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(seen.len(), map.len());
    seen.sort_unstable();
    assert_eq!(
        seen,
        (0..300u64).map(|i| (i, i + 1)).collect::<Vec<_>>()
    );

    let empty: ThreadedMultiMap<u64, u64> = ThreadedMultiMap::new();
    assert_eq!(empty.iter().next(), None);
}

#[test]
fn resize_triggers_exactly_at_the_threshold() {
    let mut map: ThreadedMultiMap<u64, u64, Mix64State> =
        ThreadedMultiMap::with_slots_and_hasher(32, Mix64State);
    assert_eq!(map.slot_count(), 32);
    assert_eq!(map.resize_threshold(), 128);

    for i in 0..128u64 {
        map.insert(i, i);
    }
    // Sitting exactly at the threshold: the resize happens on the next
    // insert, not this one.
    assert_eq!(map.slot_count(), 32);
    assert!(map.load_factor() >= 4.0);

    map.insert(128, 128);
    assert_eq!(map.slot_count(), 64);
    assert_eq!(map.resize_threshold(), 256);

    for i in 0..=128u64 {
        let mut out = Vec::new();
        map.get_values(&i, &mut out);
        assert_eq!(out, vec![i]);
    }
}

#[test]
fn mixed_key_types_round_trip() {
    let mut map: ThreadedMultiMap<String, u32> = ThreadedMultiMap::new();
    map.insert("left".to_string(), 1);
    map.insert("right".to_string(), 2);
    map.insert("left".to_string(), 3);

    let mut out = Vec::new();
    map.get_values(&"left".to_string(), &mut out);
    out.sort_unstable();
    assert_eq!(out, vec![1, 3]);
    assert_eq!(map.len(), 3);
}
