//! Benchmark for planning and scheduling overhead
//!
//! Measures:
//! - Plan construction for wide and deep catalogs
//! - Scheduler run time for a single wide layer
//! - Scheduler run time for a dependency chain
//! - Merge + tier filtering

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use metaextract_orchestration::units::StaticUnit;
use metaextract_orchestration::{
    filter, BuiltinSource, Catalog, Enablement, FileContext, MergedDocument, PlanBuilder,
    Registry, Scheduler, SchedulerConfig, TierPolicy, Unit, UnitDescriptor, UnitSource, Visibility,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `n` static units; with `chained`, unit i depends on unit i-1
fn generate_catalog(n: usize, chained: bool) -> Catalog {
    let units: Vec<Arc<dyn Unit>> = (0..n)
        .map(|i| {
            let mut desc = UnitDescriptor::new(format!("unit_{:04}", i), "1.0")
                .tag(if i % 2 == 0 { "image" } else { "forensic" });
            if chained && i > 0 {
                desc = desc.depends_on(format!("unit_{:04}", i - 1));
            }
            let fields = json!({ "index": i, "label": format!("u{}", i), "flags": [true, false] });
            let fields = fields.as_object().cloned().unwrap_or_default();
            Arc::new(StaticUnit::new(desc, fields)) as Arc<dyn Unit>
        })
        .collect();

    let source = BuiltinSource::new(units);
    let sources: [&dyn UnitSource; 1] = [&source];
    Registry::default().discover(&sources, 1).unwrap()
}

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        worker_limit: workers,
        unit_timeout: Duration::from_secs(5),
    })
}

/// Benchmark plan construction
fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");

    for num_units in [10, 100, 1000].iter() {
        let wide = generate_catalog(*num_units, false);
        let deep = generate_catalog(*num_units, true);

        group.bench_with_input(BenchmarkId::new("wide", num_units), &wide, |b, catalog| {
            b.iter(|| black_box(PlanBuilder::build(catalog)))
        });
        group.bench_with_input(BenchmarkId::new("deep", num_units), &deep, |b, catalog| {
            b.iter(|| black_box(PlanBuilder::build(catalog)))
        });
    }

    group.finish();
}

/// Benchmark scheduler runs
fn bench_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("run");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.bin");
    std::fs::write(&path, b"benchmark").unwrap();
    let ctx = Arc::new(FileContext::new(path, "application/octet-stream", 9));

    for (label, chained) in [("wide", false), ("chain", true)] {
        for num_units in [10, 100].iter() {
            let plan = PlanBuilder::build(&generate_catalog(*num_units, chained));

            group.bench_with_input(BenchmarkId::new(label, num_units), &plan, |b, plan| {
                b.to_async(&rt).iter(|| {
                    let ctx = ctx.clone();
                    async move {
                        let outcome = scheduler(8)
                            .run(
                                Uuid::new_v4(),
                                plan,
                                ctx,
                                &Enablement::all(),
                                &CancellationToken::new(),
                            )
                            .await;
                        black_box(outcome)
                    }
                })
            });
        }
    }

    group.finish();
}

/// Benchmark merge + filter
fn bench_merge_filter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.bin");
    std::fs::write(&path, b"benchmark").unwrap();
    let ctx = Arc::new(FileContext::new(path, "application/octet-stream", 9));

    let plan = PlanBuilder::build(&generate_catalog(500, false));
    let outcome = rt.block_on(scheduler(16).run(
        Uuid::new_v4(),
        &plan,
        ctx,
        &Enablement::all(),
        &CancellationToken::new(),
    ));

    let policy = TierPolicy::unrestricted("basic")
        .with_tag("forensic", Visibility::Hidden)
        .with_field("flags", Visibility::Hidden)
        .with_max_fields(400);

    c.bench_function("merge_filter_500", |b| {
        b.iter(|| {
            let merged = MergedDocument::merge(black_box(&outcome.results));
            black_box(filter(&merged, &policy))
        })
    });
}

criterion_group!(benches, bench_plan, bench_run, bench_merge_filter);
criterion_main!(benches);
