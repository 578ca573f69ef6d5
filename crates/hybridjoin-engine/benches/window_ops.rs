//! Criterion benchmarks for the join window and a single join stage.
//!
//! Every admitted tuple is indexed once and removed once, and every probe
//! walks the buckets of the fetched partition, so these dominate stage cost.

use std::time::Duration;

use chrono::NaiveDateTime;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use hybridjoin_engine::channel::{bounded, completion};
use hybridjoin_engine::stage::{Forward, JoinStage, StageSettings};
use hybridjoin_engine::window::Window;
use hybridjoin_state::prelude::*;
use hybridjoin_types::StreamTuple;

fn tuple(order: i64, customer: i64) -> StreamTuple {
    StreamTuple::new(
        Record::new()
            .with("Order_ID", order)
            .with("Customer_ID", customer),
        NaiveDateTime::default(),
    )
}

fn bench_admit_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("window/admit_take");

    for capacity in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let mut window = Window::new(capacity);
                    for i in 0..capacity as i64 {
                        window.admit(JoinKey::Int(i % 500), tuple(i, i % 500)).unwrap();
                    }
                    while let Some(key) = window.peek_oldest().cloned() {
                        window.take_bucket(&key);
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_stage_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage/run");
    let events = 20_000i64;
    group.throughput(Throughput::Elements(events as u64));

    for partition_size in [50usize, 500] {
        group.bench_with_input(
            BenchmarkId::new("partition", partition_size),
            &partition_size,
            |b, &partition_size| {
                b.iter(|| {
                    let relation = MemoryRelation::new((0..5_000).map(|id| {
                        PartitionRow::new(JoinKey::Int(id), Record::new().with("Gender", "F"))
                    }));
                    let (tx, rx) = bounded(events as usize);
                    for i in 0..events {
                        tx.put(tuple(i, (i * 7919) % 6_000)).unwrap();
                    }
                    drop(tx);
                    let (_upstream, upstream_signal) = completion();
                    let (out_tx, _out_rx) = bounded(events as usize);
                    let (done, _done_signal) = completion();
                    let settings = StageSettings::new("bench-join", "Customer_ID")
                        .window_capacity(2_000)
                        .partition_size(partition_size)
                        .idle_backoff(Duration::ZERO);
                    let stage = JoinStage::new(
                        settings,
                        rx,
                        upstream_signal,
                        relation,
                        Forward::new("bench-join".into(), out_tx, done),
                    );
                    stage.run().unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_admit_and_drain, bench_stage_run);
criterion_main!(benches);
