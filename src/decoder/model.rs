// src/decoder/model.rs

//! Decoded event shapes.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

/// Output of `decode`: the raw XML or a structured view, chosen per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Raw(RawEvent),
    Structured(StructuredEvent),
}

/// Untouched XML plus the few fields the pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub xml: String,
    pub provider: String,
    pub record_id: u64,
    pub time_created: Option<DateTime<Utc>>,
    pub level: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredEvent {
    pub system: System,
    /// Catalog message, `<RenderingInfo><Message>`, or empty.
    pub message: String,
    pub event_data: EventData,
    pub rendering: Option<RenderingInfo>,
}

/// The `<System>` section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct System {
    pub provider: Provider,
    pub event_id: EventId,
    pub version: u64,
    pub level: u64,
    pub task: u64,
    pub opcode: u64,
    pub keywords: u64,
    /// `TimeCreated/@SystemTime` as written by the OS.
    pub system_time: String,
    pub time_created: Option<DateTime<Utc>>,
    pub record_id: u64,
    pub channel: String,
    pub computer: String,
    pub execution: Execution,
    pub security: Security,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Provider {
    pub name: String,
    pub guid: String,
    pub event_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventId {
    pub id: u64,
    pub qualifiers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Execution {
    pub process_id: u64,
    pub thread_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Security {
    pub user_id: String,
}

/// One `<Data>` value. Unnamed values carry an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub name: String,
    pub value: String,
}

/// `<EventData>` (or flattened `<UserData>`) values in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventData {
    pub entries: Vec<DataField>,
}

/// Locale-rendered strings from `<RenderingInfo>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderingInfo {
    pub culture: String,
    pub message: String,
    pub level: String,
    pub task: String,
    pub opcode: String,
    pub channel: String,
    pub provider: String,
    pub keywords: Vec<String>,
}

impl DecodedEvent {
    pub fn provider(&self) -> &str {
        match self {
            DecodedEvent::Raw(r) => &r.provider,
            DecodedEvent::Structured(s) => &s.system.provider.name,
        }
    }

    pub fn record_id(&self) -> u64 {
        match self {
            DecodedEvent::Raw(r) => r.record_id,
            DecodedEvent::Structured(s) => s.system.record_id,
        }
    }

    pub fn time_created(&self) -> Option<DateTime<Utc>> {
        match self {
            DecodedEvent::Raw(r) => r.time_created,
            DecodedEvent::Structured(s) => s.system.time_created,
        }
    }

    pub fn level(&self) -> u64 {
        match self {
            DecodedEvent::Raw(r) => r.level,
            DecodedEvent::Structured(s) => s.system.level,
        }
    }
}

impl EventData {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|f| f.name == name).map(|f| f.value.as_str())
    }
}

impl StructuredEvent {
    /// JSON map used as the log record body.
    pub fn to_body(&self) -> Map<String, Value> {
        let sys = &self.system;
        let rendering = self.rendering.as_ref();
        let keywords: Vec<String> = match rendering {
            Some(r) if !r.keywords.is_empty() => r.keywords.clone(),
            _ => vec![format!("0x{:x}", sys.keywords)],
        };
        let data: Vec<Value> = self
            .event_data
            .entries
            .iter()
            .map(|f| {
                let mut pair = Map::new();
                pair.insert(f.name.clone(), Value::String(f.value.clone()));
                Value::Object(pair)
            })
            .collect();

        let body = json!({
            "channel": sys.channel,
            "computer": sys.computer,
            "event_id": { "id": sys.event_id.id, "qualifiers": sys.event_id.qualifiers },
            "keywords": keywords,
            "level": rendered_or(rendering.map(|r| &r.level), sys.level),
            "message": self.message,
            "opcode": rendered_or(rendering.map(|r| &r.opcode), sys.opcode),
            "provider": {
                "name": sys.provider.name,
                "guid": sys.provider.guid,
                "event_source": sys.provider.event_source,
            },
            "record_id": sys.record_id,
            "system_time": sys.system_time,
            "task": rendered_or(rendering.map(|r| &r.task), sys.task),
            "event_data": { "data": data },
            "execution": {
                "process_id": sys.execution.process_id,
                "thread_id": sys.execution.thread_id,
            },
            "security": { "user_id": sys.security.user_id },
        });
        match body {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Locale text when the event carried it, else the numeric value.
fn rendered_or(text: Option<&String>, fallback: u64) -> String {
    match text {
        Some(t) if !t.is_empty() => t.clone(),
        _ => fallback.to_string(),
    }
}
