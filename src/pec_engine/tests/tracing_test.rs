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

use pec_engine::sim::{SimBackend, SimConfig, SimMemory};
use pec_engine::{CommandDescriptor, EngineConfig, PacketEngine, PecError, RingConfig};
use pec_testing::tracing_subscriber::TracingSubscriber as TestSubscriber;
use tracing::Level;

#[test]
fn test_engine_spans_and_events() {
    assert!(TestSubscriber::capture_log());
    let subscriber = TestSubscriber::new(Level::TRACE);

    tracing::subscriber::with_default(subscriber.clone(), || {
        let memory = Arc::new(SimMemory::new(0, 4 * 1024 * 1024));
        let backend = SimBackend::new(memory.clone(), SimConfig::default());
        let engine =
            PacketEngine::new(EngineConfig::new(0x10_0000, 1024 * 1024), memory, [backend])
                .unwrap();

        let outer = tracing::info_span!("request_batch");
        let _entered = outer.enter();

        engine.init(0, RingConfig::default()).unwrap();
        let src = engine.arena().alloc(32).unwrap();
        let dst = engine.arena().alloc(32).unwrap();
        let (accepted, result) = engine.put(0, &[CommandDescriptor::new(1, src, dst, 32)]);
        result.unwrap();
        assert_eq!(accepted, 1);

        // fails inside an instrumented call
        let err = engine.request_result_notify(0, Box::new(|| {}), 0).unwrap_err();
        assert!(matches!(err, PecError::InvalidArgument(_)));
    });

    let batch = subscriber.spans_named("request_batch");
    assert_eq!(batch.len(), 1);

    let put = subscriber.spans_named("put");
    assert_eq!(put.len(), 1, "{}", subscriber.to_json());
    assert_eq!(put[0].parent, Some(batch[0].id));
    assert_eq!(put[0].metadata["level"], "TRACE");

    let init = subscriber.spans_named("init");
    assert_eq!(init.len(), 1);
    let up = subscriber.events_at(Level::DEBUG, "interface 0 up");
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].target, "pec_engine::engine");
    assert_eq!(up[0].span, Some(init[0].id));

    // err(Debug) reports the failure as an event inside the span
    let notify = subscriber.spans_named("request_result_notify");
    assert_eq!(notify.len(), 1);
    assert!(
        subscriber
            .events()
            .iter()
            .any(|e| e.span == Some(notify[0].id) && e.level == "ERROR")
    );
}
