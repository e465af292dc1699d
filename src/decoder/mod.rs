// src/decoder/mod.rs

//! # Event Decoder
//!
//! Turns a `NativeEventRecord` into a `DecodedEvent`.
//!
//! Key responsibilities:
//! - Raw mode: keep the XML verbatim, scan only `<System>` for the provider,
//!   record number, creation time and level.
//! - Structured mode: decode `<System>`, `<EventData>`/`<UserData>` and
//!   `<RenderingInfo>`, and pick the message (catalog text, then the
//!   embedded rendering, then empty).
//! - Never drop an event: malformed XML yields whatever was decoded so far
//!   plus a warning.

pub mod model;
mod parse;

pub use model::{
    DataField, DecodedEvent, EventData, EventId, Execution, Provider, RawEvent, RenderingInfo,
    Security, StructuredEvent, System,
};

use crate::source::NativeEventRecord;
use quick_xml::{
    Writer,
    events::{BytesEnd, BytesStart, BytesText, Event},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed event XML at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("event XML ended inside <{0}>")]
    Truncated(String),

    #[error("failed to render event data: {0}")]
    Render(String),
}

/// Decode one native record. Infallible: problems are logged and the event
/// is returned with whatever could be read.
pub fn decode(record: NativeEventRecord, raw: bool) -> DecodedEvent {
    let (parsed, err) = parse::parse(&record.xml, raw);
    if let Some(e) = &err {
        log::warn!(
            "Degraded decode of record {} from '{}': {}",
            parsed.system.record_id,
            parsed.system.provider.name,
            e
        );
    }

    if raw {
        let sys = parsed.system;
        return DecodedEvent::Raw(RawEvent {
            xml: record.xml,
            provider: sys.provider.name,
            record_id: sys.record_id,
            time_created: sys.time_created,
            level: sys.level,
        });
    }

    let message = record
        .message
        .filter(|m| !m.is_empty())
        .or_else(|| {
            parsed
                .rendering
                .as_ref()
                .map(|r| r.message.clone())
                .filter(|m| !m.is_empty())
        })
        .unwrap_or_default();

    DecodedEvent::Structured(StructuredEvent {
        system: parsed.system,
        message,
        event_data: parsed.event_data,
        rendering: parsed.rendering,
    })
}

/// Provider name from `<System>`, without decoding the rest.
pub fn peek_provider(xml: &str) -> Option<String> {
    let (parsed, _) = parse::parse(xml, true);
    Some(parsed.system.provider.name).filter(|n| !n.is_empty())
}

/// `EventRecordID` from `<System>`, 0 when absent.
pub fn peek_record_id(xml: &str) -> u64 {
    parse::parse(xml, true).0.system.record_id
}

fn render_error(e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Render(e.to_string())
}

impl EventData {
    /// Render as an `<EventData>` fragment; unnamed values get no `Name`.
    pub fn to_xml(&self) -> Result<String, DecodeError> {
        let mut writer = Writer::new(Vec::new());

        writer
            .write_event(Event::Start(BytesStart::new("EventData")))
            .map_err(render_error)?;
        for field in &self.entries {
            let mut start = BytesStart::new("Data");
            if !field.name.is_empty() {
                start.push_attribute(("Name", field.name.as_str()));
            }
            writer.write_event(Event::Start(start)).map_err(render_error)?;
            writer
                .write_event(Event::Text(BytesText::new(&field.value)))
                .map_err(render_error)?;
            writer
                .write_event(Event::End(BytesEnd::new("Data")))
                .map_err(render_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("EventData")))
            .map_err(render_error)?;

        String::from_utf8(writer.into_inner()).map_err(render_error)
    }

    /// Parse an `<EventData>` fragment as produced by `to_xml`.
    pub fn from_xml(fragment: &str) -> Result<EventData, DecodeError> {
        let (parsed, err) = parse::parse(&format!("<Event>{fragment}</Event>"), false);
        match err {
            Some(e) => Err(e),
            None => Ok(parsed.event_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'>\
        <System><Provider Name='Service Control Manager' Guid='{555908d1-a6d7-4695-8e1e-26931d2012f4}' \
        EventSourceName='Service Control Manager'/><EventID Qualifiers='16384'>7036</EventID>\
        <Version>0</Version><Level>4</Level><Task>0</Task><Opcode>0</Opcode>\
        <Keywords>0x8080000000000000</Keywords><TimeCreated SystemTime='2024-03-01T10:00:00.1234567Z'/>\
        <EventRecordID>4711</EventRecordID><Correlation/><Execution ProcessID='660' ThreadID='7240'/>\
        <Channel>System</Channel><Computer>HOST01</Computer><Security UserID='S-1-5-18'/></System>\
        <EventData><Data Name='param1'>Windows Update</Data><Data Name='param2'>running</Data>\
        <Data>unnamed &amp; escaped</Data></EventData>\
        <RenderingInfo Culture='en-US'><Message>The Windows Update service entered the running state.</Message>\
        <Level>Information</Level><Task></Task><Opcode></Opcode><Channel>System</Channel>\
        <Provider>Microsoft-Windows-Service Control Manager</Provider>\
        <Keywords><Keyword>Classic</Keyword></Keywords></RenderingInfo></Event>";

    fn record(xml: &str, message: Option<&str>) -> NativeEventRecord {
        NativeEventRecord { xml: xml.into(), message: message.map(Into::into) }
    }

    fn structured(ev: DecodedEvent) -> StructuredEvent {
        match ev {
            DecodedEvent::Structured(s) => s,
            other => panic!("expected structured event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_system_section() {
        let ev = structured(decode(record(SAMPLE, None), false));
        let sys = &ev.system;
        assert_eq!(sys.provider.name, "Service Control Manager");
        assert_eq!(sys.provider.guid, "{555908d1-a6d7-4695-8e1e-26931d2012f4}");
        assert_eq!(sys.event_id, EventId { id: 7036, qualifiers: 16384 });
        assert_eq!(sys.level, 4);
        assert_eq!(sys.keywords, 0x8080_0000_0000_0000);
        assert_eq!(sys.record_id, 4711);
        assert_eq!(sys.channel, "System");
        assert_eq!(sys.computer, "HOST01");
        assert_eq!(sys.execution, Execution { process_id: 660, thread_id: 7240 });
        assert_eq!(sys.security.user_id, "S-1-5-18");
        assert_eq!(
            sys.time_created.map(|t| t.timestamp()),
            Some(chrono::DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap().timestamp())
        );
    }

    #[test]
    fn message_prefers_catalog_then_rendering() {
        let ev = structured(decode(record(SAMPLE, Some("from catalog")), false));
        assert_eq!(ev.message, "from catalog");

        let ev = structured(decode(record(SAMPLE, None), false));
        assert_eq!(ev.message, "The Windows Update service entered the running state.");

        let bare = "<Event><System><Provider Name='x'/></System></Event>";
        let ev = structured(decode(record(bare, None), false));
        assert_eq!(ev.message, "");
        assert!(ev.event_data.is_empty());
    }

    #[test]
    fn event_data_keeps_order_and_unnamed_values() {
        let ev = structured(decode(record(SAMPLE, None), false));
        let names: Vec<_> = ev.event_data.entries.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["param1", "param2", ""]);
        assert_eq!(ev.event_data.get(""), Some("unnamed & escaped"));
    }

    #[test]
    fn raw_mode_keeps_xml_verbatim() {
        match decode(record(SAMPLE, Some("ignored")), true) {
            DecodedEvent::Raw(raw) => {
                assert_eq!(raw.xml, SAMPLE);
                assert_eq!(raw.provider, "Service Control Manager");
                assert_eq!(raw.record_id, 4711);
                assert_eq!(raw.level, 4);
            }
            other => panic!("expected raw event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_xml_degrades_instead_of_dropping() {
        let broken = "<Event><System><Provider Name='half'/><EventRecordID>3</EventRecordID></Sys";
        let ev = decode(record(broken, Some("still here")), false);
        assert_eq!(ev.provider(), "half");
        assert_eq!(ev.record_id(), 3);
        assert_eq!(structured(ev).message, "still here");
    }

    #[test]
    fn body_has_expected_shape() {
        let ev = structured(decode(record(SAMPLE, None), false));
        let body = ev.to_body();
        assert_eq!(body["event_id"]["id"], 7036);
        assert_eq!(body["event_id"]["qualifiers"], 16384);
        assert_eq!(body["level"], "Information");
        assert_eq!(body["keywords"][0], "Classic");
        assert_eq!(body["provider"]["event_source"], "Service Control Manager");
        assert_eq!(body["event_data"]["data"][0]["param1"], "Windows Update");
        assert_eq!(body["event_data"]["data"][2][""], "unnamed & escaped");
        assert_eq!(body["execution"]["process_id"], 660);
        assert_eq!(body["record_id"], 4711);
    }

    #[test]
    fn peek_provider_reads_only_system() {
        assert_eq!(peek_provider(SAMPLE).as_deref(), Some("Service Control Manager"));
        assert_eq!(peek_provider("<Event><System/></Event>"), None);
        assert_eq!(peek_record_id(SAMPLE), 4711);
        assert_eq!(peek_record_id("<Event><System/></Event>"), 0);
    }
}
