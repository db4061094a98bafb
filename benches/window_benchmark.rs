//! Windowing throughput benchmarks.
//!
//! - `build_window`: sort and truncate one long spool into a `K x (F + 1)` matrix
//! - `encode_bundle`: serialise one bundle to `.npz` bytes
//! - `build_entity`: read both spools from disk and window them
//!
//! ```bash
//! cargo bench --bench window_benchmark
//! ```

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use edgeseq_core::{
    Direction, EntityId, EntityIndex, Label, OverflowPolicy, SequenceBuilder, SpoolEntry,
    SpoolStore, WindowSpec, build_window,
};
use std::hint::black_box;

const FEATURES: usize = 95;
const WINDOW: usize = 50;

fn spec() -> WindowSpec {
    WindowSpec {
        window_len: WINDOW,
        feature_width: FEATURES,
        max_temporal_key: 1_000_000,
        overflow: OverflowPolicy::Reject,
    }
}

fn entries(count: u64, seed: u64) -> Vec<SpoolEntry> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..count)
        .map(|ordinal| SpoolEntry {
            ordinal,
            tx_id: rng.u64(1..1_000_000),
            features: (0..FEATURES).map(|_| rng.f32()).collect(),
        })
        .collect()
}

fn bench_build_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_window");
    for count in [10u64, 1_000, 20_000] {
        let input = entries(count, count);
        group.bench_function(format!("{count}_entries"), |b| {
            b.iter_batched(
                || input.clone(),
                |input| build_window(EntityId(1), input, &spec()).unwrap(),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_encode_bundle(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let index = EntityIndex::from_entries([(EntityId(1), Some(Label::Suspicious))]).unwrap();
    let mut spools = SpoolStore::open(dir.path(), FEATURES, false).unwrap();
    spools.initialize(&index).unwrap();
    for entry in entries(500, 7) {
        spools.append(EntityId(1), Direction::Inbound, &entry).unwrap();
        spools.append(EntityId(1), Direction::Outbound, &entry).unwrap();
    }
    spools.flush().unwrap();

    let builder = SequenceBuilder::new(&spools, &index, spec());
    c.bench_function("build_entity", |b| {
        b.iter(|| black_box(builder.build(EntityId(1), 0).unwrap()));
    });

    let bundle = builder.build(EntityId(1), 0).unwrap().bundle;
    c.bench_function("encode_bundle", |b| {
        b.iter(|| black_box(bundle.to_npz_bytes().unwrap()));
    });
}

criterion_group!(benches, bench_build_window, bench_encode_bundle);
criterion_main!(benches);
