// src/decoder/parse.rs

//! Streaming walk over Windows event XML.
//!
//! Elements are matched by their path below `<Event>`; namespaces are ignored.
//! The walk keeps everything it gathered when the document turns out to be
//! malformed and reports the error next to the partial result.

use super::{
    DecodeError,
    model::{DataField, EventData, RenderingInfo, System},
};
use chrono::{DateTime, Utc};
use quick_xml::{Reader, events::BytesStart, events::Event};

#[derive(Debug, Default)]
pub(crate) struct Parsed {
    pub system: System,
    pub event_data: EventData,
    pub rendering: Option<RenderingInfo>,
}

/// Parse `xml`; with `system_only` the walk stops after `</System>`.
pub(crate) fn parse(xml: &str, system_only: bool) -> (Parsed, Option<DecodeError>) {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut out = Parsed::default();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut data_name: Option<String> = None;

    loop {
        let event = match reader.read_event() {
            Ok(ev) => ev,
            Err(e) => {
                let err = DecodeError::Xml {
                    position: reader.buffer_position() as u64,
                    message: e.to_string(),
                };
                return (out, Some(err));
            }
        };

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                text.clear();
                out.open(&stack, &name, &e, &mut data_name);
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                text.clear();
                out.open(&stack, &name, &e, &mut data_name);
                stack.push(name);
                out.close(&stack, "", &mut data_name);
                stack.pop();
            }
            Event::Text(t) => match t.unescape() {
                Ok(s) => text.push_str(&s),
                Err(e) => {
                    let err = DecodeError::Xml {
                        position: reader.buffer_position() as u64,
                        message: e.to_string(),
                    };
                    return (out, Some(err));
                }
            },
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(_) => {
                out.close(&stack, &text, &mut data_name);
                text.clear();
                let closed = stack.pop();
                if system_only && stack.len() == 1 && closed.as_deref() == Some("System") {
                    return (out, None);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match stack.pop() {
        Some(open) => (out, Some(DecodeError::Truncated(open))),
        None => (out, None),
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Decimal or `0x`-prefixed hex; anything else reads as 0.
pub(crate) fn parse_u64(s: &str) -> u64 {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.unwrap_or_else(|_| {
        if !s.is_empty() {
            log::debug!("unparsable number '{}' read as 0", s);
        }
        0
    })
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim()).ok().map(|t| t.with_timezone(&Utc))
}

fn path_is(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

impl Parsed {
    /// Element opened; `stack` holds its ancestors.
    fn open(&mut self, stack: &[String], name: &str, e: &BytesStart<'_>, data_name: &mut Option<String>) {
        if path_is(stack, &["Event", "System"]) {
            let sys = &mut self.system;
            match name {
                "Provider" => {
                    sys.provider.name = attr(e, "Name").unwrap_or_default();
                    sys.provider.guid = attr(e, "Guid").unwrap_or_default();
                    sys.provider.event_source = attr(e, "EventSourceName").unwrap_or_default();
                }
                "EventID" => {
                    sys.event_id.qualifiers = attr(e, "Qualifiers").map_or(0, |q| parse_u64(&q));
                }
                "TimeCreated" => {
                    sys.system_time = attr(e, "SystemTime").unwrap_or_default();
                    sys.time_created = parse_time(&sys.system_time);
                }
                "Execution" => {
                    sys.execution.process_id = attr(e, "ProcessID").map_or(0, |v| parse_u64(&v));
                    sys.execution.thread_id = attr(e, "ThreadID").map_or(0, |v| parse_u64(&v));
                }
                "Security" => sys.security.user_id = attr(e, "UserID").unwrap_or_default(),
                _ => {}
            }
        } else if path_is(stack, &["Event", "EventData"]) && name == "Data" {
            *data_name = attr(e, "Name");
        } else if path_is(stack, &["Event"]) && name == "RenderingInfo" {
            self.rendering = Some(RenderingInfo {
                culture: attr(e, "Culture").unwrap_or_default(),
                ..RenderingInfo::default()
            });
        }
    }

    /// Element closed; `stack` still ends with it.
    fn close(&mut self, stack: &[String], text: &str, data_name: &mut Option<String>) {
        let (Some(name), parents) = (stack.last(), &stack[..stack.len().saturating_sub(1)]) else {
            return;
        };

        if path_is(parents, &["Event", "System"]) {
            let sys = &mut self.system;
            match name.as_str() {
                "EventID" => sys.event_id.id = parse_u64(text),
                "Version" => sys.version = parse_u64(text),
                "Level" => sys.level = parse_u64(text),
                "Task" => sys.task = parse_u64(text),
                "Opcode" => sys.opcode = parse_u64(text),
                "Keywords" => sys.keywords = parse_u64(text),
                "EventRecordID" => sys.record_id = parse_u64(text),
                "Channel" => sys.channel = text.trim().to_string(),
                "Computer" => sys.computer = text.trim().to_string(),
                _ => {}
            }
        } else if path_is(parents, &["Event", "EventData"]) && name == "Data" {
            self.event_data.entries.push(DataField {
                name: data_name.take().unwrap_or_default(),
                value: text.to_string(),
            });
        } else if parents.len() == 3 && parents[0] == "Event" && parents[1] == "UserData" {
            self.event_data.entries.push(DataField { name: name.clone(), value: text.to_string() });
        } else if let Some(r) = self.rendering.as_mut() {
            if path_is(parents, &["Event", "RenderingInfo"]) {
                let value = text.trim().to_string();
                match name.as_str() {
                    "Message" => r.message = value,
                    "Level" => r.level = value,
                    "Task" => r.task = value,
                    "Opcode" => r.opcode = value,
                    "Channel" => r.channel = value,
                    "Provider" => r.provider = value,
                    _ => {}
                }
            } else if path_is(parents, &["Event", "RenderingInfo", "Keywords"]) && name == "Keyword" {
                r.keywords.push(text.trim().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_decimal_and_hex() {
        assert_eq!(parse_u64("42"), 42);
        assert_eq!(parse_u64(" 0x10 "), 16);
        assert_eq!(parse_u64("0x8000000000000000"), 0x8000_0000_0000_0000);
        assert_eq!(parse_u64(""), 0);
        assert_eq!(parse_u64("abc"), 0);
    }

    #[test]
    fn system_only_stops_early() {
        let xml = "<Event><System><Provider Name='p'/><EventRecordID>9</EventRecordID></System>\
                   <EventData><Data>x</Data></EventData></Event>";
        let (parsed, err) = parse(xml, true);
        assert!(err.is_none());
        assert_eq!(parsed.system.provider.name, "p");
        assert_eq!(parsed.system.record_id, 9);
        assert!(parsed.event_data.is_empty());
    }

    #[test]
    fn user_data_is_flattened() {
        let xml = "<Event><System/><UserData><LogFileCleared xmlns='x'>\
                   <SubjectUserName>bob</SubjectUserName></LogFileCleared></UserData></Event>";
        let (parsed, err) = parse(xml, false);
        assert!(err.is_none());
        assert_eq!(parsed.event_data.get("SubjectUserName"), Some("bob"));
    }

    #[test]
    fn truncated_document_keeps_what_was_read() {
        let xml = "<Event><System><Provider Name='cut'/><Level>2</Level>";
        let (parsed, err) = parse(xml, false);
        assert_eq!(parsed.system.provider.name, "cut");
        assert_eq!(parsed.system.level, 2);
        assert!(err.is_some());
    }
}
