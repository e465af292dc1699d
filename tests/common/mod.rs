// tests/common/mod.rs

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use eventlog_receiver::delivery::{LogRecord, LogSink, SinkError};
use std::{
    collections::VecDeque,
    sync::{Mutex, Once},
    time::{Duration, Instant},
};

static LOGGING: Once = Once::new();

/// Route `log` output to stdout once per test binary; `cargo test` captures it.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, msg, record| {
                out.finish(format_args!("[{:5}][{}] {}", record.level(), record.target(), msg))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply();
    });
}

/// Records every accepted batch; optionally fails calls from a script first.
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<LogRecord>>,
    script: Mutex<VecDeque<SinkError>>,
    calls: Mutex<u32>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next calls with these errors, in order.
    pub fn failing_with(errors: impl IntoIterator<Item = SinkError>) -> Self {
        let sink = Self::default();
        sink.script.lock().unwrap().extend(errors);
        sink
    }

    /// Fail every call with a transient error until `heal` is called.
    pub fn always_failing() -> Self {
        Self::failing_with(std::iter::repeat_n(SinkError::Transient("sink down".into()), 1_000_000))
    }

    pub fn heal(&self) {
        self.script.lock().unwrap().clear();
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    /// `body.message` of every structured record, in delivery order.
    pub fn messages(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r.body.as_map())
            .map(|m| m["message"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// `body.record_id` of every structured record, in delivery order.
    pub fn record_ids(&self) -> Vec<u64> {
        self.records()
            .iter()
            .filter_map(|r| r.body.as_map())
            .filter_map(|m| m["record_id"].as_u64())
            .collect()
    }
}

impl LogSink for CaptureSink {
    fn consume(&self, records: &[LogRecord]) -> Result<(), SinkError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
