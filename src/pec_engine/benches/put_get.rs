/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pec_engine::sim::{SimBackend, SimConfig, SimMemory};
use pec_engine::{
    Accessibility, BufferHandle, CommandDescriptor, EngineConfig, PacketEngine, RingConfig,
};

type Engine = PacketEngine<SimBackend<SimMemory>, SimMemory>;

const POOL_BASE: u64 = 0x40_0000;
const HOST_BASE: u64 = 0x80_0000;

// Helper to create an initialized single-interface engine
fn make_engine(ring: RingConfig) -> Engine {
    let memory = Arc::new(SimMemory::new(0, 16 * 1024 * 1024));
    let sim = SimConfig {
        command_capacity: 64,
        result_capacity: 64,
        max_logical_descriptors: 64,
        max_packets: 64,
        ..Default::default()
    };
    let backend = SimBackend::new(memory.clone(), sim);
    let engine =
        PacketEngine::new(EngineConfig::new(POOL_BASE, 2 * 1024 * 1024), memory, [backend]).unwrap();
    engine.init(0, ring).unwrap();
    engine
}

fn requests(engine: &Engine, count: usize, size: usize, foreign: bool) -> Vec<CommandDescriptor> {
    let buffer = |i: usize, half: u64| -> BufferHandle {
        if foreign {
            let addr = HOST_BASE + (i as u64 * 2 + half) * size.next_multiple_of(64) as u64;
            engine.arena().register(addr, size, Accessibility::Foreign).unwrap()
        } else {
            engine.arena().alloc(size).unwrap()
        }
    };
    (0..count)
        .map(|i| CommandDescriptor::new(i as u64, buffer(i, 0), buffer(i, 1), size as u32))
        .collect()
}

// One full put / process / get cycle
fn run(engine: &Engine, batch: &[CommandDescriptor]) {
    let sim = engine.interface(0).unwrap().backend();
    let (accepted, result) = engine.put(0, black_box(batch));
    result.unwrap();
    sim.process(accepted).unwrap();
    let results = engine.get(0, accepted).unwrap();
    assert_eq!(results.len(), accepted);
}

// Direct buffers, batch size sweep
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for count in [1, 8, 32, 64].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let engine = make_engine(RingConfig::default());
            let batch = requests(&engine, count, 256, false);
            b.iter(|| run(&engine, &batch));
        });
    }
    group.finish();
}

// Foreign buffers through the bounce pool
fn bench_bounced(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounced");

    for size in [64, 1500, 4096].iter() {
        group.throughput(Throughput::Bytes(32 * *size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let engine = make_engine(RingConfig::default());
            let batch = requests(&engine, 32, size, true);
            b.iter(|| run(&engine, &batch));
        });
    }
    group.finish();
}

// Partial accept: every round rolls back half the batch
fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollback");

    group.bench_function("half_accepted", |b| {
        let engine = make_engine(RingConfig::default());
        let batch = requests(&engine, 32, 256, true);
        let sim = engine.interface(0).unwrap().backend();
        b.iter(|| {
            sim.set_accept_limit(16);
            run(&engine, &batch);
        });
    });

    group.finish();
}

// Continuous scatter over preloaded fragments
fn bench_continuous(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuous");

    group.bench_function("preload_and_drain", |b| {
        let mut ring = RingConfig::default();
        ring.set_continuous_scatter(true);
        let engine = make_engine(ring);
        let fragments: Vec<_> = (0..16).map(|_| engine.arena().alloc(512).unwrap()).collect();
        let batch: Vec<_> = (0..8)
            .map(|i| CommandDescriptor {
                user_tag: i,
                src: Some(engine.arena().alloc(512).unwrap()),
                src_byte_count: 512,
                ..Default::default()
            })
            .collect();
        let sim = engine.interface(0).unwrap().backend();

        b.iter(|| {
            assert_eq!(engine.scatter_preload(0, &fragments[..8]).unwrap(), 8);
            let (accepted, result) = engine.put(0, black_box(&batch));
            result.unwrap();
            sim.process(accepted).unwrap();
            assert_eq!(engine.get(0, accepted).unwrap().len(), accepted);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_bounced,
    bench_rollback,
    bench_continuous,
);

criterion_main!(benches);
