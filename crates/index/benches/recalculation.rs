use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use zonegraph_core::{Edge, EdgeId, Permissions, VertexId, ZoneId};
use zonegraph_index::{naive, EffectiveVertex, Feeds, Graph, Instrumentation, ZoneIndex};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn vertex(layer: usize, i: usize) -> VertexId {
    VertexId::new(ZoneId::new("a"), format!("l{layer}v{i}"))
}

fn perms(i: usize) -> Permissions {
    Permissions::from_bits(1 << (i % 32))
}

/// `layers` layers of `width` vertices; every vertex points to two vertices
/// of the next layer.
fn layered_graph(layers: usize, width: usize) -> Graph {
    let mut graph = Graph::new(ZoneId::new("a"));
    for layer in 0..layers - 1 {
        for i in 0..width {
            for j in [i, (i + 1) % width] {
                let id = EdgeId::new(vertex(layer, i), vertex(layer + 1, j));
                graph.add_edge(id, perms(i + j)).unwrap();
            }
        }
    }
    graph
}

// ---------------------------------------------------------------------------
// Benchmark: recalculating one effective vertex
// ---------------------------------------------------------------------------

fn bench_recalculate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let target = vertex(1, 0);

    let mut group = c.benchmark_group("recalculate_permissions");
    for count in [8, 64, 512] {
        let edges: Vec<Edge> = (0..count)
            .map(|i| Edge::new(vertex(0, i), target.clone(), perms(i)))
            .collect();
        let mut base = EffectiveVertex::new();
        base.add_intermediate_vertices(edges.iter().map(|e| e.src().clone()), &());

        group.bench_with_input(BenchmarkId::from_parameter(count), &edges, |b, edges| {
            b.to_async(&rt).iter(|| {
                let mut vertex = base.clone();
                async move { black_box(vertex.recalculate_permissions(edges).await) }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: full reindex
// ---------------------------------------------------------------------------

fn bench_reindex(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("reindex");
    group.sample_size(20);
    for (layers, width) in [(3, 10), (4, 20), (5, 30)] {
        let graph = layered_graph(layers, width);
        let touched: BTreeSet<VertexId> = graph.vertex_ids();
        let touched = &touched;

        group.bench_with_input(
            BenchmarkId::new(format!("{layers}layers_{width}wide"), graph.edge_count()),
            &graph,
            |b, graph| {
                b.to_async(&rt).iter(|| async move {
                    let index = ZoneIndex::new(ZoneId::new("a"), Instrumentation::disabled());
                    black_box(
                        index
                            .reindex(graph, &Feeds::new(), touched, "bench")
                            .await
                            .unwrap(),
                    )
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: naive traversal vs materialized lookup
// ---------------------------------------------------------------------------

fn bench_naive_vs_indexed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let graph = layered_graph(5, 30);
    let index = ZoneIndex::new(ZoneId::new("a"), Instrumentation::disabled());
    rt.block_on(index.reindex(&graph, &Feeds::new(), &graph.vertex_ids(), "bench"))
        .unwrap();
    let query = EdgeId::new(vertex(0, 0), vertex(4, 3));
    let (index, query) = (&index, &query);

    let mut group = c.benchmark_group("naive_vs_indexed");

    group.bench_function("naive", |b| {
        b.iter(|| black_box(naive::effective_permissions(&graph, query)));
    });

    group.bench_function("indexed", |b| {
        b.to_async(&rt)
            .iter(|| async move { black_box(index.effective_permissions(query).await) });
    });

    group.finish();
}

criterion_group!(benches, bench_recalculate, bench_reindex, bench_naive_vs_indexed);
criterion_main!(benches);
