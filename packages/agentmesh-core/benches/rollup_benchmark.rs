//! Benchmark for rollup metric aggregation (§4.4) over deep session trees.
//!
//! Measures `get_rollup_metrics` cost as a function of subtree size, the way
//! the teacher's incremental benchmark measured update cost as a function of
//! repository size.

use agentmesh_core::{Config, EventBus, InitialSession, SessionRegistry};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn build_chain(depth: usize) -> (SessionRegistry, i64) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let registry = SessionRegistry::new(Config::default(), None, EventBus::new());
        let root = registry
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let mut parent = root;
        for _ in 0..depth {
            parent = registry
                .register(InitialSession {
                    project_key: "/repo".to_string(),
                    parent_id: Some(parent),
                })
                .await
                .unwrap();
        }
        (registry, root)
    })
}

fn bench_rollup(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollup_metrics");
    for depth in [10usize, 100, 500] {
        let (registry, root) = build_chain(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| registry.get_rollup_metrics(root).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rollup);
criterion_main!(benches);
