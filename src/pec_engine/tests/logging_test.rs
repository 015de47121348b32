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

use std::sync::Arc;

use log::Level;
use pec_engine::sim::{SimBackend, SimConfig, SimMemory};
use pec_engine::{
    Accessibility, BufferHandle, CommandDescriptor, EngineConfig, PacketEngine, RingConfig,
};
use pec_testing::simplelogger::{LOGGER, SimpleLogger};

type Engine = PacketEngine<SimBackend<SimMemory>, SimMemory>;

fn engine() -> Engine {
    let memory = Arc::new(SimMemory::new(0, 4 * 1024 * 1024));
    let backend = SimBackend::new(memory.clone(), SimConfig::default());
    PacketEngine::new(EngineConfig::new(0x10_0000, 1024 * 1024), memory, [backend]).unwrap()
}

fn foreign(engine: &Engine, addr: u64, len: usize) -> BufferHandle {
    let handle = engine
        .arena()
        .register(addr, len, Accessibility::Foreign)
        .unwrap();
    engine.arena().write(handle, 0, &vec![0x5a; len]).unwrap();
    handle
}

#[test]
fn test_engine_logging() {
    SimpleLogger::initialize_test_logger();
    LOGGER.clear_log_calls();

    let engine = engine();
    engine.init(0, RingConfig::default()).unwrap();
    assert_eq!(LOGGER.find(Level::Debug, "interface 0 up").len(), 1);

    let requests: Vec<_> = (0..4u64)
        .map(|i| {
            let base = 0x30_0000 + i * 0x1000;
            let src = foreign(&engine, base, 64);
            let dst = foreign(&engine, base + 0x800, 64);
            CommandDescriptor::new(i, src, dst, 64)
        })
        .collect();

    let sim = engine.interface(0).unwrap().backend();
    sim.set_accept_limit(1);
    let (accepted, result) = engine.put(0, &requests);
    result.unwrap();
    assert_eq!(accepted, 1);

    let rollback = LOGGER.find(Level::Warn, "rolling back 3 of 4 requests");
    assert_eq!(rollback.len(), 1, "{}", LOGGER.to_json());
    assert!(rollback[0].target.starts_with("pec_engine::engine"));
    assert!(rollback[0].line.is_some());

    // the accepted request is still queued when the interface goes down
    engine.uninit(0).unwrap();
    assert_eq!(LOGGER.find(Level::Warn, "dropped 1 queued requests").len(), 1);
    assert_eq!(engine.arena().outstanding_bounces(), 0);

    LOGGER.test_log_records(|calls| {
        assert!(calls.iter().all(|c| c.target.starts_with("pec_engine")));
        assert!(calls.iter().all(|c| c.level <= Level::Debug));
    });
    assert_eq!(LOGGER.num_log_calls(), 0);
}
