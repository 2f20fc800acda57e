//! Store Performance Benchmarks
//!
//! - Reducer execution: pure in-memory operations
//! - Store throughput: synchronous send through the action queue
//! - Effect overhead: spawning, merging and cancelling effects
//! - Identified collection: lookup and copy-on-write mutation
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup
#![allow(dead_code)] // Benchmark data structures may have unused fields

use composable_arch_core::dependencies::DependencyValues;
use composable_arch_core::{Effect, Effects, Identifiable, IdentifiedVec, Reducer, smallvec};
use composable_arch_runtime::Store;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

#[derive(Clone, Debug)]
struct BenchState {
    counter: i64,
    data: Vec<u8>, // For testing state size impact
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            counter: 0,
            data: vec![0; 1024], // 1KB of data
        }
    }
}

#[derive(Clone, Debug)]
enum BenchAction {
    Increment,
    Reset,
    SetValue(i64),
    Spawn,
    SpawnMany,
    StartTimer,
    StopTimer,
    NoOp,
}

struct BenchReducer;

impl Reducer for BenchReducer {
    type State = BenchState;
    type Action = BenchAction;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        _dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        match action {
            BenchAction::Increment => {
                state.counter += 1;
                Effects::new()
            },
            BenchAction::Reset => {
                state.counter = 0;
                Effects::new()
            },
            BenchAction::SetValue(v) => {
                state.counter = v;
                Effects::new()
            },
            BenchAction::Spawn => smallvec![Effect::future(async { Some(BenchAction::NoOp) })],
            BenchAction::SpawnMany => smallvec![Effect::merge(
                (0..3).map(|_| Effect::future(async { Some(BenchAction::NoOp) }))
            )],
            BenchAction::StartTimer => smallvec![
                Effect::run(|_| std::future::pending::<()>()).cancellable("timer", true)
            ],
            BenchAction::StopTimer => smallvec![Effect::cancel("timer")],
            BenchAction::NoOp => Effects::new(),
        }
    }
}

/// Benchmark reducer execution in isolation (no Store overhead)
fn benchmark_reducer_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("reducer");
    group.throughput(Throughput::Elements(1));

    let reducer = BenchReducer;
    let dependencies = DependencyValues::test();

    group.bench_function("increment", |b| {
        let mut state = BenchState::default();
        b.iter(|| {
            let _effects = reducer.reduce(&mut state, black_box(BenchAction::Increment), &dependencies);
        });
    });

    group.bench_function("set_value", |b| {
        let mut state = BenchState::default();
        b.iter(|| {
            let _effects = reducer.reduce(&mut state, black_box(BenchAction::SetValue(42)), &dependencies);
        });
    });

    group.finish();
}

/// Benchmark Store throughput (actions/sec)
fn benchmark_store_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_throughput");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_action", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);
        b.iter(|| {
            let _ = store.send(black_box(BenchAction::Increment));
        });
    });

    group.bench_function("send_and_read_state", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);
        b.iter(|| {
            let _ = store.send(black_box(BenchAction::Increment));
            black_box(store.state(|s| s.counter));
        });
    });

    group.finish();
}

/// Benchmark effect execution overhead
fn benchmark_effect_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("effect_overhead");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    group.bench_function("effect_future", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);
        b.to_async(&runtime).iter(|| async {
            let mut handle = store.send(black_box(BenchAction::Spawn)).expect("store is running");
            handle.wait().await;
        });
    });

    group.bench_function("effect_merge", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);
        b.to_async(&runtime).iter(|| async {
            let mut handle = store.send(black_box(BenchAction::SpawnMany)).expect("store is running");
            handle.wait().await;
        });
    });

    group.bench_function("start_and_cancel", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);
        b.to_async(&runtime).iter(|| async {
            let mut started = store.send(BenchAction::StartTimer).expect("store is running");
            let _ = store.send(BenchAction::StopTimer);
            started.wait().await;
        });
    });

    group.finish();
}

/// Benchmark concurrent Store access
fn benchmark_concurrent_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");
    group.throughput(Throughput::Elements(10));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    group.bench_function("10_concurrent_sends", |b| {
        let store = Store::new(BenchState::default(), BenchReducer);

        b.to_async(&runtime).iter(|| async {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        let _ = store.send(BenchAction::Increment);
                    })
                })
                .collect();

            for handle in handles {
                handle.await.expect("Task failed");
            }
        });
    });

    group.finish();
}

#[derive(Clone, Debug)]
struct Row {
    id: u32,
    title: String,
}

impl Identifiable for Row {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }
}

/// Benchmark identified collection lookups and copy-on-write updates
fn benchmark_identified_vec(c: &mut Criterion) {
    let mut group = c.benchmark_group("identified_vec");

    let rows: IdentifiedVec<Row> = (0..10_000)
        .map(|id| Row {
            id,
            title: format!("row {id}"),
        })
        .collect();

    group.bench_function("get_by_id", |b| {
        b.iter(|| black_box(rows.get(&black_box(5_000))));
    });

    group.bench_function("update_unique", |b| {
        let mut rows = rows.clone();
        b.iter(|| {
            rows.update(&black_box(5_000), |row| row.title.push('!'));
        });
    });

    group.bench_function("update_shared", |b| {
        b.iter(|| {
            let mut copy = rows.clone();
            copy.update(&black_box(5_000), |row| row.title.clear());
            black_box(copy)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_reducer_execution,
    benchmark_store_throughput,
    benchmark_effect_overhead,
    benchmark_concurrent_access,
    benchmark_identified_vec,
);
criterion_main!(benches);
