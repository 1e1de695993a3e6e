//! Benchmarks for the hot paths in the predict serving plane: the
//! pipeline executor's per-instance dispatch, the predict batcher's
//! accumulate-and-pad loop, and wire tensor encode/decode.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ms_serving_core::batcher::{Model, PredictBatcher};
use ms_serving_core::error::StageError;
use ms_serving_core::instance::{Instance, InstanceContext, Phase};
use ms_serving_core::pipeline::{PhaseExecutor, PipelineExecutor};
use ms_serving_core::tensor::{DataType, Tensor};
use ms_serving_core::wire::{tensor_from_wire, tensor_to_wire};

struct EchoExecutor;

#[async_trait]
impl PhaseExecutor for EchoExecutor {
    async fn run(&self, instance: &Instance) -> Result<Vec<(String, Tensor)>, StageError> {
        let t = instance.get(Phase::Input, "x").unwrap().clone();
        Ok(vec![("y".to_string(), t)])
    }
}

fn make_tensor(size: usize) -> Tensor {
    Tensor::new_owned(DataType::U8, vec![size as i64], vec![7u8; size]).unwrap()
}

fn bench_pipeline_single_instance(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("pipeline_single_instance");
    for &size in &[64usize, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("predict_only", size), &size, |b, &size| {
            let exec = PipelineExecutor::new(4).with_phase(Phase::Predict, Arc::new(EchoExecutor), 4);
            b.iter(|| {
                rt.block_on(async {
                    let mut inst = Instance::new();
                    inst.set(Phase::Input, "x", make_tensor(size));
                    let ctx = InstanceContext::new(1, 0, "run");
                    let (out, ctx) = exec.run_instance(inst, ctx).await;
                    black_box((out, ctx));
                })
            });
        });
    }
    group.finish();
}

fn bench_pipeline_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("pipeline_batch");
    for &batch in &[1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("instances", batch), &batch, |b, &batch| {
            let exec = PipelineExecutor::new(4).with_phase(Phase::Predict, Arc::new(EchoExecutor), 8);
            b.iter(|| {
                rt.block_on(async {
                    let mut instances = Vec::with_capacity(batch);
                    let mut contexts = Vec::with_capacity(batch);
                    for i in 0..batch {
                        let mut inst = Instance::new();
                        inst.set(Phase::Input, "x", make_tensor(256));
                        instances.push(inst);
                        contexts.push(InstanceContext::new(1, i, "run"));
                    }
                    let results = exec.run_batch(instances, contexts).await;
                    black_box(results);
                })
            });
        });
    }
    group.finish();
}

struct EchoModel;

#[async_trait]
impl Model for EchoModel {
    async fn predict_batch(
        &self,
        batch: Vec<Instance>,
    ) -> Result<Vec<Vec<(String, Tensor)>>, StageError> {
        Ok(batch
            .iter()
            .map(|_| vec![("y".to_string(), make_tensor(64))])
            .collect())
    }
}

fn bench_batcher_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("batcher_throughput");
    for &batch_size in &[1usize, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("batch_size", batch_size),
            &batch_size,
            |b, &batch_size| {
                let handle = rt.block_on(async {
                    PredictBatcher::spawn(
                        Arc::new(EchoModel),
                        batch_size,
                        Duration::from_millis(2),
                        std::collections::HashSet::new(),
                    )
                });
                b.iter(|| {
                    rt.block_on(async {
                        let mut tasks = Vec::with_capacity(batch_size);
                        for _ in 0..batch_size {
                            let h = handle.clone();
                            tasks.push(tokio::spawn(async move { h.predict(Instance::new()).await }));
                        }
                        for t in tasks {
                            black_box(t.await.unwrap().unwrap());
                        }
                    })
                });
            },
        );
    }
    group.finish();
}

fn bench_tensor_wire_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("tensor_wire_roundtrip");
    for &size in &[64usize, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_decode", size), &size, |b, &size| {
            let t = make_tensor(size);
            b.iter(|| {
                let wire = tensor_to_wire(&t);
                let back = tensor_from_wire(&wire).unwrap();
                black_box(back);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pipeline_single_instance,
    bench_pipeline_batch,
    bench_batcher_throughput,
    bench_tensor_wire_roundtrip,
);
criterion_main!(benches);
