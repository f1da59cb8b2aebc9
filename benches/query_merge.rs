//! Merged search latency over a mutable store and an installed snapshot.
//!
//! Run with: cargo bench --bench query_merge

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use edgesync::store::install_snapshot;
use edgesync::{EdgeConfig, ImmutableHandle, MutableStore, QueryMerger};
use edgesync_core::hnsw::Node;
use edgesync_core::{l2_normalized, sha256_hex, EmbeddingRecord, HnswGraph, SnapshotWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

const DIM: usize = 512;

fn random_unit(rng: &mut StdRng) -> Vec<f32> {
    let v: Vec<f32> = (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect();
    l2_normalized(&v)
}

/// Ring lattice: each node linked to its `m` nearest ordinals. Not a real
/// HNSW build, but it gives the searcher realistic fan-out.
fn ring_graph(n: usize, m: usize) -> HnswGraph {
    let nodes = (0..n)
        .map(|i| {
            let links = (1..=m / 2)
                .flat_map(|d| [(i + d) % n, (i + n - d) % n])
                .filter(|&j| j != i)
                .collect();
            Node::new(i, vec![links])
        })
        .collect();
    HnswGraph::from_parts(nodes, Some(0), 0, m).expect("ring graph")
}

fn setup(dir: &std::path::Path, indexed: usize, fresh: usize) -> QueryMerger {
    let mut rng = StdRng::seed_from_u64(0xED9E);
    let config = EdgeConfig::from_data_dir(dir.to_path_buf(), DIM);
    std::fs::create_dir_all(&config.immutable_dir).expect("immutable dir");
    std::fs::create_dir_all(&config.tmp_dir).expect("tmp dir");

    let mut writer = SnapshotWriter::new(DIM, 1).with_graph(ring_graph(indexed, 16));
    for i in 0..indexed {
        writer
            .push(&EmbeddingRecord::new(random_unit(&mut rng), json!({"i": i})))
            .expect("push");
    }
    let bytes = writer.finish().expect("finish");
    let store = install_snapshot(&config, &bytes, &sha256_hex(&bytes), None).expect("install");

    let mutable = Arc::new(MutableStore::new(DIM, config.parallel_scan_min));
    for i in 0..fresh {
        mutable
            .insert(EmbeddingRecord::new(random_unit(&mut rng), json!({"fresh": i})))
            .expect("insert");
    }
    QueryMerger::new(
        &config,
        mutable,
        Arc::new(ImmutableHandle::new(Some(Arc::new(store)))),
    )
}

fn bench_merged_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_search");
    group.sample_size(30);
    let mut rng = StdRng::seed_from_u64(7);
    let query = random_unit(&mut rng);

    for fresh in [100usize, 1_000, 10_000] {
        let dir = tempfile::tempdir().expect("tempdir");
        let merger = setup(dir.path(), 20_000, fresh);
        group.bench_with_input(BenchmarkId::new("k3_mutable", fresh), &fresh, |b, _| {
            b.iter(|| merger.search(black_box(&query), 3).expect("search"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merged_search);
criterion_main!(benches);
