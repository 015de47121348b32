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

use std::sync::{Mutex, Once};
use std::thread::current;

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};
use serde::Serialize;

use crate::ENGINE_TARGET;

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub struct LogCall {
    #[serde(serialize_with = "level_name")]
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
}

fn level_name<S: serde::Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(level.as_str())
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());
static NUMBER_OF_ENABLED_CALLS: Mutex<usize> = Mutex::new(0);

/// Records everything the engine logs so tests can assert on it.
pub struct SimpleLogger {}

impl SimpleLogger {
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    pub fn num_enabled_calls(&self) -> usize {
        *NUMBER_OF_ENABLED_CALLS.lock().unwrap()
    }

    pub fn num_log_calls(&self) -> usize {
        LOGCALLS.lock().unwrap().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        LOGCALLS.lock().unwrap().get(idx).cloned()
    }

    /// Recorded calls at `level` whose message contains `needle`.
    pub fn find(&self, level: Level, needle: &str) -> Vec<LogCall> {
        LOGCALLS
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.level == level && call.args.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear_log_calls(&self) {
        let mut logcalls = LOGCALLS.lock().unwrap();
        logcalls.clear();
        *NUMBER_OF_ENABLED_CALLS.lock().unwrap() = 0;
    }

    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let logcalls = LOGCALLS.lock().unwrap();
        f(&logcalls);
        drop(logcalls);
        self.clear_log_calls();
    }

    /// Dump the recorded calls as JSON, for failing test output.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&*LOGCALLS.lock().unwrap()).unwrap_or_default()
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Only engine records are counted; dependencies log through the same
        // global logger.
        let engine = metadata.target().starts_with(ENGINE_TARGET);
        if engine {
            *NUMBER_OF_ENABLED_CALLS.lock().unwrap() += 1;
        }
        engine && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut logcalls = LOGCALLS.lock().unwrap();
        logcalls.push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            line: record.line(),
            file: record.file().map(|file| file.to_string()),
            module_path: record
                .module_path()
                .map(|module_path| module_path.to_string()),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}
