//! Tile pipeline benchmarks: pure kernels, native tile generation from a
//! container, and JSON encoding of matrix rows.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;

use loom_store::{Attribute, MatrixStore};
use loom_tiles::tile::{magnify, merge, rescale_native};
use loom_tiles::{MemoryTileStore, TileEngine, TILE_SIZE};
use loom_viewer::metadata::matrix_metadata;

// =========================================================================
// Data generation (deterministic LCG)
// =========================================================================

fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut state = seed;
    Array2::from_shape_fn((rows, cols), |_| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        // Sparse, count-like values.
        let r = (state >> 40) % 100;
        if r < 70 {
            0.0
        } else {
            (r - 69) as f32
        }
    })
}

fn create_store(dir: &std::path::Path, rows: usize, cols: usize) -> MatrixStore {
    let mut row_attrs = BTreeMap::new();
    row_attrs.insert(
        "Gene".to_string(),
        Attribute::String((0..rows).map(|i| format!("g{i}")).collect()),
    );
    let mut col_attrs = BTreeMap::new();
    col_attrs.insert(
        "Cell".to_string(),
        Attribute::String((0..cols).map(|i| format!("c{i}")).collect()),
    );
    MatrixStore::create(
        dir.join("bench.loom"),
        &random_matrix(rows, cols, 42),
        row_attrs,
        col_attrs,
    )
    .unwrap()
}

// =========================================================================
// Kernels
// =========================================================================

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_kernels");
    group.throughput(Throughput::Elements((TILE_SIZE * TILE_SIZE) as u64));

    let block = random_matrix(TILE_SIZE, TILE_SIZE, 7);
    let mins = vec![0.0; TILE_SIZE];
    let maxes = vec![30.0; TILE_SIZE];
    group.bench_function("rescale_native", |b| {
        b.iter(|| rescale_native(black_box(&block), &mins, &maxes))
    });

    let tiles: Vec<_> = (0..4)
        .map(|s| rescale_native(&random_matrix(TILE_SIZE, TILE_SIZE, s), &mins, &maxes))
        .collect();
    group.bench_function("merge", |b| {
        b.iter(|| merge(black_box(&tiles[0]), &tiles[1], &tiles[2], &tiles[3]))
    });

    for d in [1u32, 4, 8] {
        group.bench_with_input(BenchmarkId::new("magnify", d), &d, |b, &d| {
            b.iter(|| magnify(black_box(&tiles[0]), 1, 1, d))
        });
    }

    group.finish();
}

// =========================================================================
// Engine
// =========================================================================

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_engine");
    group.sample_size(10);

    let dir = tempfile::tempdir().unwrap();
    let store = create_store(dir.path(), 1_024, 1_024);

    group.bench_function("native_tile_uncached", |b| {
        b.iter(|| {
            let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
            engine.get_tile(black_box(1), black_box(2), 8).unwrap()
        })
    });

    group.bench_function("prepare_1k_x_1k", |b| {
        b.iter(|| {
            let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
            engine.prepare(false).unwrap()
        })
    });

    group.finish();
}

// =========================================================================
// Expansion encoding
// =========================================================================

fn bench_row_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_metadata");
    for &cols in &[1_000usize, 10_000] {
        let row: Vec<f32> = random_matrix(1, cols, 3).iter().copied().collect();
        group.throughput(Throughput::Elements(cols as u64));
        group.bench_with_input(BenchmarkId::from_parameter(cols), &row, |b, row| {
            b.iter(|| matrix_metadata(black_box(row)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_kernels, bench_engine, bench_row_encoding);
criterion_main!(benches);
