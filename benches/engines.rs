use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hashdex::{ChainedMultiMap, FlatMultiMap, Mix64State, Percent, ThreadedMultiMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const KEY_COUNT: u64 = 100_000;

/// Fixed 64-byte payload, the size class of a small index record.
type Blob = [u8; 64];

const PAYLOAD: Blob = [0; 64];

fn sequential_keys() -> Vec<u64> {
    (0..KEY_COUNT).collect()
}

fn random_keys() -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(0x1d10_7e5e_eded_b017);
    (0..KEY_COUNT).map(|_| rng.gen_range(0..KEY_COUNT)).collect()
}

fn bench_flat(c: &mut Criterion, name: &str, keys: &[u64]) {
    c.bench_function(&format!("flat_insert_{name}"), |b| {
        b.iter(|| {
            let mut map = FlatMultiMap::with_capacity_hasher_and_policy(
                1024,
                Mix64State,
                Percent::<75>,
            );
            for &k in keys {
                map.insert(k, PAYLOAD);
            }
            black_box(map.len())
        })
    });

    let mut map =
        FlatMultiMap::with_capacity_hasher_and_policy(1024, Mix64State, Percent::<75>);
    for &k in keys {
        map.insert(k, PAYLOAD);
    }
    c.bench_function(&format!("flat_read_{name}"), |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &k in keys {
                if map.get_first(&k).is_some() {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });
}

fn bench_threaded(c: &mut Criterion, name: &str, keys: &[u64]) {
    c.bench_function(&format!("threaded_insert_{name}"), |b| {
        b.iter(|| {
            let mut map = ThreadedMultiMap::with_slots_and_hasher(1024, Mix64State);
            for &k in keys {
                map.insert(k, PAYLOAD);
            }
            black_box(map.len())
        })
    });

    let mut map = ThreadedMultiMap::with_slots_and_hasher(1024, Mix64State);
    for &k in keys {
        map.insert(k, PAYLOAD);
    }
    let mut out: Vec<Blob> = Vec::with_capacity(100);
    c.bench_function(&format!("threaded_read_{name}"), |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &k in keys {
                out.clear();
                map.get_values(&k, &mut out);
                hits += out.len();
            }
            black_box(hits)
        })
    });
}

fn bench_chained(c: &mut Criterion, name: &str, keys: &[u64]) {
    c.bench_function(&format!("chained_insert_{name}"), |b| {
        b.iter(|| {
            let mut map = ChainedMultiMap::with_slots_and_hasher(1024, Mix64State);
            for &k in keys {
                map.insert(k, PAYLOAD);
            }
            black_box(map.len())
        })
    });

    let mut map = ChainedMultiMap::with_slots_and_hasher(1024, Mix64State);
    for &k in keys {
        map.insert(k, PAYLOAD);
    }
    let mut out: Vec<Blob> = Vec::with_capacity(100);
    c.bench_function(&format!("chained_read_{name}"), |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &k in keys {
                out.clear();
                map.get_values(&k, &mut out);
                hits += out.len();
            }
            black_box(hits)
        })
    });
}

fn bench_std_hashmap(c: &mut Criterion, name: &str, keys: &[u64]) {
    c.bench_function(&format!("std_hashmap_insert_{name}"), |b| {
        b.iter(|| {
            let mut map: HashMap<u64, Vec<Blob>> = HashMap::with_capacity(1024);
            for &k in keys {
                map.entry(k).or_default().push(PAYLOAD);
            }
            black_box(map.len())
        })
    });

    let mut map: HashMap<u64, Vec<Blob>> = HashMap::with_capacity(1024);
    for &k in keys {
        map.entry(k).or_default().push(PAYLOAD);
    }
    c.bench_function(&format!("std_hashmap_read_{name}"), |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for &k in keys {
                if let Some(values) = map.get(&k) {
                    hits += values.len();
                }
            }
            black_box(hits)
        })
    });
}

fn sequential_workload(c: &mut Criterion) {
    let keys = sequential_keys();
    bench_flat(c, "seq", &keys);
    bench_threaded(c, "seq", &keys);
    bench_chained(c, "seq", &keys);
    bench_std_hashmap(c, "seq", &keys);
}

fn random_workload(c: &mut Criterion) {
    let keys = random_keys();
    bench_flat(c, "random", &keys);
    bench_threaded(c, "random", &keys);
    bench_chained(c, "random", &keys);
    bench_std_hashmap(c, "random", &keys);
}

criterion_group!(benches, sequential_workload, random_workload);
criterion_main!(benches);
