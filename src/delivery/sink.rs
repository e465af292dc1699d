// src/delivery/sink.rs

//! Downstream log records and the sink contract.

use crate::decoder::DecodedEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;

/// Severity derived from the Windows event level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Unspecified,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// 1 critical, 2 error, 3 warning, 0/4 information, 5 verbose.
    pub fn from_level(level: u64) -> Self {
        match level {
            1 => Severity::Fatal,
            2 => Severity::Error,
            3 => Severity::Warn,
            0 | 4 => Severity::Info,
            5 => Severity::Debug,
            _ => Severity::Unspecified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    /// Raw event XML.
    Text(String),
    /// Structured event fields.
    Map(Map<String, Value>),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s.as_str()),
            Body::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            Body::Map(m) => Some(m),
            Body::Text(_) => None,
        }
    }
}

/// One record handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Event creation time.
    pub timestamp: Option<DateTime<Utc>>,
    /// When the receiver read the event.
    pub observed_timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub body: Body,
}

impl LogRecord {
    pub fn from_event(event: &DecodedEvent, observed: DateTime<Utc>) -> Self {
        let body = match event {
            DecodedEvent::Raw(raw) => Body::Text(raw.xml.clone()),
            DecodedEvent::Structured(s) => Body::Map(s.to_body()),
        };
        LogRecord {
            timestamp: event.time_created(),
            observed_timestamp: observed,
            severity: Severity::from_level(event.level()),
            body,
        }
    }
}

/// Consumer of log records. Called from the channel's worker thread.
pub trait LogSink: Send + Sync {
    fn consume(&self, records: &[LogRecord]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Worth retrying.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

/// Writes one JSON object per record and line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        JsonLinesSink::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> LogSink for JsonLinesSink<W> {
    fn consume(&self, records: &[LogRecord]) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(records.len() * 512);
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| SinkError::Permanent(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(&buf)
            .and_then(|_| out.flush())
            .map_err(|e| SinkError::Transient(e.to_string()))
    }
}
