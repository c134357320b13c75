//! Benchmarks for pipeline planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gateflow::config::PipelineConfig;
use gateflow::context::RunContext;
use gateflow::trigger::TriggerEvaluator;

fn planning_benchmark(c: &mut Criterion) {
    let Ok(graph) = PipelineConfig::builtin().and_then(PipelineConfig::into_graph) else {
        return;
    };
    let evaluator = TriggerEvaluator::default();
    let push = RunContext::push("main", "4f2a9c1");
    let pull_request = RunContext::pull_request("main", "4f2a9c1");

    c.bench_function("parse_builtin_pipeline", |b| {
        b.iter(|| black_box(PipelineConfig::builtin()))
    });

    c.bench_function("plan_push_to_primary", |b| {
        b.iter(|| {
            let enablement = evaluator.evaluate(&graph, black_box(&push));
            black_box(graph.plan(&enablement.enabled))
        })
    });

    c.bench_function("plan_pull_request", |b| {
        b.iter(|| {
            let enablement = evaluator.evaluate(&graph, black_box(&pull_request));
            black_box(graph.plan(&enablement.enabled))
        })
    });
}

criterion_group!(benches, planning_benchmark);
criterion_main!(benches);
