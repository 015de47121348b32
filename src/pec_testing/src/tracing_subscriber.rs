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

//! A `tracing` subscriber that keeps every span and event in memory.
//!
//! Records routed through the `log` facade are picked up as well once
//! [`TracingSubscriber::capture_log`] has been called; their metadata is
//! normalized back to the original log target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_core::field::{Field, Visit};
use tracing_core::span::{Attributes, Current, Id, Record};
use tracing_core::{Event, Level, Metadata, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_serde::AsSerde;

static LOG_TRACER: Lazy<bool> = Lazy::new(|| tracing_log::LogTracer::init().is_ok());

#[derive(Clone, Debug, Serialize)]
pub struct SpanRecord {
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    pub metadata: Value,
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub level: String,
    pub target: String,
    /// Innermost span entered when the event fired.
    pub span: Option<u64>,
    pub fields: Map<String, Value>,
}

impl EventRecord {
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }
}

#[derive(Default)]
struct State {
    spans: Vec<(SpanRecord, &'static Metadata<'static>)>,
    events: Vec<EventRecord>,
    stack: Vec<u64>,
}

#[derive(Clone)]
pub struct TracingSubscriber {
    max_level: Level,
    next_id: Arc<AtomicU64>,
    state: Arc<Mutex<State>>,
}

struct FieldVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // log metadata fields added by tracing-log
        if field.name().starts_with("log.") {
            return;
        }
        self.0
            .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name().starts_with("log.") {
            return;
        }
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
}

impl TracingSubscriber {
    pub fn new(max_level: Level) -> Self {
        Self {
            max_level,
            next_id: Arc::new(AtomicU64::new(1)),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Route `log` records into the current `tracing` dispatcher. Returns
    /// false if another logger was installed first.
    pub fn capture_log() -> bool {
        *LOG_TRACER
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        let state = self.state.lock().unwrap();
        state.spans.iter().map(|(span, _)| span.clone()).collect()
    }

    pub fn spans_named(&self, name: &str) -> Vec<SpanRecord> {
        self.spans().into_iter().filter(|s| s.name == name).collect()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.state.lock().unwrap().events.clone()
    }

    /// Events at `level` whose message contains `needle`.
    pub fn events_at(&self, level: Level, needle: &str) -> Vec<EventRecord> {
        let level = level.as_str();
        self.events()
            .into_iter()
            .filter(|e| e.level == level && e.message().is_some_and(|m| m.contains(needle)))
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.spans.clear();
        state.events.clear();
    }

    pub fn to_json(&self) -> String {
        let state = self.state.lock().unwrap();
        let spans: Vec<&SpanRecord> = state.spans.iter().map(|(span, _)| span).collect();
        serde_json::json!({ "spans": spans, "events": state.events }).to_string()
    }
}

impl Subscriber for TracingSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= self.max_level
    }

    fn new_span(&self, span: &Attributes<'_>) -> Id {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();

        let parent = if span.is_root() {
            None
        } else {
            span.parent()
                .map(Id::into_u64)
                .or_else(|| state.stack.last().copied())
        };
        let mut fields = Map::new();
        span.record(&mut FieldVisitor(&mut fields));
        let record = SpanRecord {
            id,
            name: span.metadata().name().to_string(),
            parent,
            metadata: serde_json::to_value(span.metadata().as_serde()).unwrap_or_default(),
            fields,
        };
        state.spans.push((record, span.metadata()));
        Id::from_u64(id)
    }

    fn record(&self, span: &Id, values: &Record<'_>) {
        let mut state = self.state.lock().unwrap();
        if let Some((record, _)) = state.spans.iter_mut().find(|(s, _)| s.id == span.into_u64()) {
            values.record(&mut FieldVisitor(&mut record.fields));
        }
    }

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());
        if !self.enabled(metadata) {
            return;
        }

        let mut fields = Map::new();
        event.record(&mut FieldVisitor(&mut fields));
        let mut state = self.state.lock().unwrap();
        let span = state.stack.last().copied();
        state.events.push(EventRecord {
            level: metadata.level().as_str().to_string(),
            target: metadata.target().to_string(),
            span,
            fields,
        });
    }

    fn enter(&self, span: &Id) {
        self.state.lock().unwrap().stack.push(span.into_u64());
    }

    fn exit(&self, span: &Id) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.stack.iter().rposition(|&id| id == span.into_u64()) {
            state.stack.remove(pos);
        }
    }

    fn current_span(&self) -> Current {
        let state = self.state.lock().unwrap();
        let current = state
            .stack
            .last()
            .and_then(|&id| state.spans.iter().find(|(s, _)| s.id == id));
        match current {
            Some((span, metadata)) => Current::new(Id::from_u64(span.id), metadata),
            None => Current::none(),
        }
    }
}
