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

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pec_engine::sim::{SimBackend, SimConfig, SimMemory};
use pec_engine::{
    Accessibility, CommandDescriptor, EngineConfig, PacketEngine, PecErrorKind, RingConfig,
};

const HOST_BASE: u64 = 0x80_0000;
const MAX_OPS: usize = 64;

#[derive(Arbitrary, Debug)]
enum Op {
    Put { count: u8, size: u16, foreign: bool },
    Preload { count: u8, size: u16 },
    Process(u8),
    ProcessSegments(u8),
    Get(u8),
    Notify(u8),
    Uninit,
    Init,
}

// This fuzz target drives random put / process / get sequences against the
// simulated ring backend and checks that nothing leaks or goes out of step.
fuzz_target!(|data: (RingConfig, bool, Vec<Op>)| {
    let (ring, separate_rings, ops) = data;
    let memory = Arc::new(SimMemory::new(0, 16 * 1024 * 1024));
    let sim = SimConfig {
        command_capacity: 8,
        result_capacity: 8,
        max_logical_descriptors: 8,
        max_packets: 8,
        separate_rings,
        ..Default::default()
    };
    let backend = SimBackend::new(memory.clone(), sim);
    let engine =
        PacketEngine::new(EngineConfig::new(0x40_0000, 1024 * 1024), memory, [backend]).unwrap();
    let Ok(()) = engine.init(0, ring) else {
        return;
    };
    let sim = engine.interface(0).unwrap().backend();
    let mut next_host = HOST_BASE;
    let mut next_tag = 0u64;

    for op in ops.into_iter().take(MAX_OPS) {
        match op {
            Op::Put { count, size, foreign } => {
                let size = usize::from(size % 2048) + 1;
                let requests: Vec<_> = (0..count % 9)
                    .map(|_| {
                        let src = if foreign && !ring.continuous_scatter() {
                            let handle = engine
                                .arena()
                                .register(next_host, size, Accessibility::Foreign)
                                .unwrap();
                            next_host += size.next_multiple_of(64) as u64;
                            handle
                        } else {
                            engine.arena().alloc(size).unwrap_or_else(|_| {
                                let handle = engine
                                    .arena()
                                    .register(next_host, size, Accessibility::Accessible)
                                    .unwrap();
                                next_host += size.next_multiple_of(64) as u64;
                                handle
                            })
                        };
                        next_tag += 1;
                        CommandDescriptor::new(next_tag, src, src, size as u32)
                    })
                    .collect();
                let (accepted, result) = engine.put(0, &requests);
                assert!(accepted <= requests.len());
                if let Err(e) = result {
                    assert_ne!(e.kind(), PecErrorKind::Internal, "{e}");
                }
            }
            Op::Preload { count, size } => {
                let size = usize::from(size % 2048) + 1;
                let buffers: Vec<_> = (0..count % 9)
                    .filter_map(|_| engine.arena().alloc(size).ok())
                    .collect();
                if let Err(e) = engine.scatter_preload(0, &buffers) {
                    assert_ne!(e.kind(), PecErrorKind::Internal, "{e}");
                }
            }
            Op::Process(n) => {
                sim.process(usize::from(n)).unwrap();
            }
            Op::ProcessSegments(n) => {
                sim.process_segments(usize::from(n)).unwrap();
            }
            Op::Get(limit) => match engine.get(0, usize::from(limit)) {
                Ok(results) => assert!(results.len() <= usize::from(limit)),
                Err(e) => assert_ne!(e.kind(), PecErrorKind::Internal, "{e}"),
            },
            Op::Notify(count) => {
                let _ = engine.request_result_notify(0, Box::new(|| {}), usize::from(count));
            }
            Op::Uninit => engine.uninit(0).unwrap(),
            Op::Init => engine.init(0, ring).unwrap(),
        }
    }

    engine.uninit(0).unwrap();
    assert_eq!(engine.arena().outstanding_bounces(), 0);
});
