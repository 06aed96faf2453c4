use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use changewatch_core::{DbName, ListenerConfig, ListenerRecord};
use changewatch_events::{Change, ChangeDispatcher, DispatchError, PendingOps};
use changewatch_infra::{
    BatchEngine, ClaimProtocol, InMemoryListenerStore, Scheduling, StoreScheduling,
};
use tokio::runtime::Runtime;

/// Dispatcher that issues one already-completed operation per change.
struct ReadyDispatcher;

#[async_trait]
impl ChangeDispatcher for ReadyDispatcher {
    async fn dispatch(
        &self,
        _change: &Change,
        _db_name: &str,
        pending: &mut PendingOps,
    ) -> Result<(), DispatchError> {
        pending.push(Box::pin(async { Ok(()) }));
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime")
}

fn db_names(count: usize) -> Vec<DbName> {
    (0..count).map(|i| DbName::escape(&format!("db-{i}"))).collect()
}

fn bench_claim_burst(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_burst");

    for burst in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::new("fresh_records", burst), burst, |b, &burst| {
            let names = db_names(burst);
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryListenerStore::arc();
                    let scheduling = StoreScheduling::arc(store.clone());
                    scheduling.install_views().await.expect("install views");
                    let claim = ClaimProtocol::new(store, scheduling, &ListenerConfig::default());
                    black_box(claim.dirty_if_clean_or_locked(names.clone()).await)
                })
            });
        });
    }

    group.finish();
}

fn bench_claim_already_queued(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_already_queued");
    let names = db_names(100);

    let store = InMemoryListenerStore::arc();
    let scheduling = StoreScheduling::arc(store.clone());
    let claim = ClaimProtocol::new(store, scheduling.clone(), &ListenerConfig::default());
    rt.block_on(async {
        scheduling.install_views().await.expect("install views");
        claim
            .dirty_if_clean_or_locked(names.clone())
            .await
            .expect("initial claim");
    });

    group.throughput(Throughput::Elements(names.len() as u64));
    group.bench_function("skip_100", |b| {
        b.iter(|| rt.block_on(claim.dirty_if_clean_or_locked(black_box(names.clone()))));
    });

    group.finish();
}

fn bench_batch_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_throughput");

    for batch_size in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("dispatch_and_advance", batch_size),
            batch_size,
            |b, &batch_size| {
                let store = InMemoryListenerStore::arc();
                store.create_database("orders").expect("create database");
                for i in 0..batch_size {
                    store
                        .record_change("orders", &format!("doc-{i}"), serde_json::json!({ "i": i }))
                        .expect("record change");
                }
                let config = ListenerConfig::default().with_batch_size(batch_size);
                let engine = BatchEngine::new(
                    store.clone(),
                    ReadyDispatcher,
                    StoreScheduling::arc(store.clone()),
                    &config,
                );

                b.iter(|| {
                    // Fresh record each time so every iteration replays the full page.
                    let fresh = ListenerRecord::new_dirty(DbName::escape("orders"), Utc::now());
                    let listener = store.insert_listener(fresh).expect("insert listener");
                    black_box(rt.block_on(engine.run_batch(&listener)))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_burst,
    bench_claim_already_queued,
    bench_batch_throughput
);
criterion_main!(benches);
