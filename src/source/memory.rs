// src/source/memory.rs

//! In-process event log.
//!
//! Holds named channels of rendered records and serves them through the same
//! `EventSource`/`Subscription` contract as the Windows backend. Records are
//! numbered per channel starting at 1, like `EventRecordID`. Channel names
//! are case-insensitive, as on Windows.
//!
//! Besides writing events it can deny access to a channel, inject read
//! failures and clear a channel, which covers the failure paths of the
//! subscription manager without an OS.

use super::{EventSource, NativeEventRecord, OpenError, StartPosition, Subscription, SubscriptionError};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

const EVENT_NS: &str = "http://schemas.microsoft.com/win/2004/08/events/event";

// ───── event builder ────────────────────────────────────────────────────────

/// An event to append to a channel.
#[derive(Debug, Clone)]
pub struct EventEntry {
    provider: String,
    provider_guid: Option<String>,
    event_id: u64,
    qualifiers: u64,
    level: u64,
    task: u64,
    opcode: u64,
    keywords: u64,
    time_created: Option<DateTime<Utc>>,
    message: Option<String>,
    rendered_message: Option<String>,
    data: Vec<(Option<String>, String)>,
    process_id: u32,
    thread_id: u32,
    user_id: Option<String>,
}

impl EventEntry {
    pub fn new(provider: impl Into<String>, event_id: u64) -> Self {
        EventEntry {
            provider: provider.into(),
            provider_guid: None,
            event_id,
            qualifiers: 0,
            level: 4,
            task: 0,
            opcode: 0,
            keywords: 0x80_0000_0000_0000,
            time_created: None,
            message: None,
            rendered_message: None,
            data: Vec::new(),
            process_id: std::process::id(),
            thread_id: 0,
            user_id: None,
        }
    }

    /// What a classic `ReportEvent` call produces: one unnamed insertion
    /// string and a catalog message equal to it.
    pub fn report(provider: impl Into<String>, event_id: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        EventEntry::new(provider, event_id).message(message.clone()).data(message)
    }

    pub fn level(mut self, level: u64) -> Self {
        self.level = level;
        self
    }

    pub fn qualifiers(mut self, qualifiers: u64) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    pub fn task(mut self, task: u64) -> Self {
        self.task = task;
        self
    }

    pub fn opcode(mut self, opcode: u64) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn keywords(mut self, keywords: u64) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn provider_guid(mut self, guid: impl Into<String>) -> Self {
        self.provider_guid = Some(guid.into());
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time_created = Some(time);
        self
    }

    /// Message the provider's catalog resolves to.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Message embedded in `<RenderingInfo>`, as in forwarded events.
    pub fn rendered_message(mut self, message: impl Into<String>) -> Self {
        self.rendered_message = Some(message.into());
        self
    }

    /// Drop the catalog message; the provider has no message file.
    pub fn without_catalog(mut self) -> Self {
        self.message = None;
        self
    }

    /// Append an unnamed `<Data>` value.
    pub fn data(mut self, value: impl Into<String>) -> Self {
        self.data.push((None, value.into()));
        self
    }

    /// Append a `<Data Name=...>` value.
    pub fn named_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((Some(name.into()), value.into()));
        self
    }

    pub fn execution(mut self, process_id: u32, thread_id: u32) -> Self {
        self.process_id = process_id;
        self.thread_id = thread_id;
        self
    }

    pub fn user_id(mut self, sid: impl Into<String>) -> Self {
        self.user_id = Some(sid.into());
        self
    }

    fn render(&self, channel: &str, computer: &str, record_id: u64, time: &DateTime<Utc>) -> String {
        let mut xml = String::with_capacity(512);
        let _ = write!(xml, "<Event xmlns='{EVENT_NS}'><System>");
        let _ = write!(xml, "<Provider Name='{}'", escape(self.provider.as_str()));
        if let Some(guid) = &self.provider_guid {
            let _ = write!(xml, " Guid='{}'", escape(guid.as_str()));
        }
        let _ = write!(xml, " EventSourceName='{}'/>", escape(self.provider.as_str()));
        let _ = write!(
            xml,
            "<EventID Qualifiers='{}'>{}</EventID><Version>0</Version><Level>{}</Level>\
             <Task>{}</Task><Opcode>{}</Opcode><Keywords>0x{:x}</Keywords>\
             <TimeCreated SystemTime='{}'/><EventRecordID>{}</EventRecordID><Correlation/>\
             <Execution ProcessID='{}' ThreadID='{}'/><Channel>{}</Channel><Computer>{}</Computer>",
            self.qualifiers,
            self.event_id,
            self.level,
            self.task,
            self.opcode,
            self.keywords,
            time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            record_id,
            self.process_id,
            self.thread_id,
            escape(channel),
            escape(computer),
        );
        match &self.user_id {
            Some(sid) => {
                let _ = write!(xml, "<Security UserID='{}'/>", escape(sid.as_str()));
            }
            None => xml.push_str("<Security/>"),
        }
        xml.push_str("</System>");

        if !self.data.is_empty() {
            xml.push_str("<EventData>");
            for (name, value) in &self.data {
                match name {
                    Some(n) => {
                        let _ = write!(xml, "<Data Name='{}'>{}</Data>", escape(n.as_str()), escape(value.as_str()));
                    }
                    None => {
                        let _ = write!(xml, "<Data>{}</Data>", escape(value.as_str()));
                    }
                }
            }
            xml.push_str("</EventData>");
        }

        if let Some(msg) = &self.rendered_message {
            let _ = write!(
                xml,
                "<RenderingInfo Culture='en-US'><Message>{}</Message><Level>Information</Level>\
                 <Task></Task><Opcode>Info</Opcode><Channel>{}</Channel><Provider>{}</Provider>\
                 <Keywords><Keyword>Classic</Keyword></Keywords></RenderingInfo>",
                escape(msg.as_str()),
                escape(channel),
                escape(self.provider.as_str()),
            );
        }
        xml.push_str("</Event>");
        xml
    }
}

// ───── event log ────────────────────────────────────────────────────────────

struct StoredRecord {
    record_id: u64,
    time_created: DateTime<Utc>,
    native: NativeEventRecord,
}

struct ChannelState {
    name: String,
    records: Vec<StoredRecord>,
    next_record_id: u64,
    /// Bumped by `clear`; open subscriptions notice and report a reset.
    generation: u64,
    denied: bool,
    pending_failures: u32,
    subscribers: usize,
}

#[derive(Default)]
struct Shared {
    channels: Mutex<HashMap<String, ChannelState>>,
    appended: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelState>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a shared in-memory event log.
#[derive(Clone)]
pub struct MemoryEventLog {
    shared: Arc<Shared>,
    computer: Arc<str>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        MemoryEventLog { shared: Arc::new(Shared::default()), computer: Arc::from("localhost") }
    }

    /// A log pre-populated with the given channels.
    pub fn with_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let log = Self::new();
        for ch in channels {
            log.create_channel(ch);
        }
        log
    }

    /// Create `channel` if it does not exist yet.
    pub fn create_channel(&self, channel: impl Into<String>) {
        let name = channel.into();
        self.shared.lock().entry(name.to_lowercase()).or_insert_with(|| ChannelState {
            name,
            records: Vec::new(),
            next_record_id: 1,
            generation: 0,
            denied: false,
            pending_failures: 0,
            subscribers: 0,
        });
    }

    /// Make subsequent subscriptions to `channel` fail with access denied.
    pub fn deny_access(&self, channel: &str) {
        if let Some(state) = self.shared.lock().get_mut(&channel.to_lowercase()) {
            state.denied = true;
        }
    }

    /// Make the next `count` reads on `channel` fail.
    pub fn inject_read_failures(&self, channel: &str, count: u32) {
        if let Some(state) = self.shared.lock().get_mut(&channel.to_lowercase()) {
            state.pending_failures += count;
        }
        self.shared.appended.notify_all();
    }

    /// Drop all stored records; record numbering continues.
    pub fn clear(&self, channel: &str) {
        if let Some(state) = self.shared.lock().get_mut(&channel.to_lowercase()) {
            state.records.clear();
            state.generation += 1;
        }
        self.shared.appended.notify_all();
    }

    /// Append an event and return its record number.
    pub fn write(&self, channel: &str, entry: EventEntry) -> Result<u64, OpenError> {
        let mut channels = self.shared.lock();
        let state = channels
            .get_mut(&channel.to_lowercase())
            .ok_or_else(|| OpenError::ChannelNotFound(channel.to_string()))?;

        let record_id = state.next_record_id;
        state.next_record_id += 1;
        let time_created = entry.time_created.unwrap_or_else(Utc::now);
        let xml = entry.render(&state.name, &self.computer, record_id, &time_created);
        state.records.push(StoredRecord {
            record_id,
            time_created,
            native: NativeEventRecord { xml, message: entry.message.clone() },
        });
        drop(channels);

        self.shared.appended.notify_all();
        Ok(record_id)
    }

    /// Subscriptions on `channel` that have not been dropped yet.
    pub fn open_subscriptions(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .get(&channel.to_lowercase())
            .map_or(0, |s| s.subscribers)
    }
}

impl EventSource for MemoryEventLog {
    fn subscribe(
        &self,
        channel: &str,
        start: &StartPosition,
    ) -> Result<Box<dyn Subscription>, OpenError> {
        let mut channels = self.shared.lock();
        let state = channels
            .get_mut(&channel.to_lowercase())
            .ok_or_else(|| OpenError::ChannelNotFound(channel.to_string()))?;
        if state.denied {
            return Err(OpenError::AccessDenied(channel.to_string()));
        }

        let records = &state.records;
        let cursor = match start {
            StartPosition::Beginning => 0,
            StartPosition::End => records.len(),
            StartPosition::AfterRecord(n) => records.partition_point(|r| r.record_id <= *n),
            StartPosition::Since(t) => records
                .iter()
                .position(|r| r.time_created >= *t)
                .unwrap_or(records.len()),
        };
        let passed = passed_record(state, cursor);
        state.subscribers += 1;
        log::debug!("memory subscription on '{}' at {:?} (cursor {})", state.name, start, cursor);

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            key: channel.to_lowercase(),
            channel: channel.to_string(),
            cursor,
            generation: state.generation,
            passed,
        }))
    }
}

/// Record number just before `cursor`; past the tail this is the last
/// number handed out, so records written later still follow it.
fn passed_record(state: &ChannelState, cursor: usize) -> u64 {
    match state.records.get(cursor) {
        Some(next) => next.record_id - 1,
        None => state.next_record_id - 1,
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    key: String,
    channel: String,
    cursor: usize,
    generation: u64,
    passed: u64,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(state) = self.shared.lock().get_mut(&self.key) {
            state.subscribers = state.subscribers.saturating_sub(1);
        }
    }
}

impl Subscription for MemorySubscription {
    fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<NativeEventRecord>, SubscriptionError> {
        let deadline = Instant::now() + wait;
        let mut channels = self.shared.lock();

        loop {
            let Some(state) = channels.get_mut(&self.key) else {
                return Err(SubscriptionError::ChannelReset { channel: self.channel.clone() });
            };
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(SubscriptionError::Read {
                    channel: self.channel.clone(),
                    message: "injected read failure".into(),
                });
            }
            if state.generation != self.generation {
                return Err(SubscriptionError::ChannelReset { channel: self.channel.clone() });
            }
            if self.cursor < state.records.len() {
                let end = state.records.len().min(self.cursor + max.max(1));
                let batch = state.records[self.cursor..end]
                    .iter()
                    .map(|r| r.native.clone())
                    .collect();
                self.passed = state.records[end - 1].record_id;
                self.cursor = end;
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            channels = self
                .shared
                .appended
                .wait_timeout(channels, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn position(&self) -> Option<u64> {
        Some(self.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Box<dyn Subscription>) -> Vec<NativeEventRecord> {
        sub.next_batch(100, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn start_positions_pick_the_right_record() {
        let log = MemoryEventLog::with_channels(["Application"]);
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        for i in 0..4 {
            log.write("Application", EventEntry::report("src", 1, format!("m{i}")).at(t0 + chrono::Duration::minutes(i)))
                .unwrap();
        }

        let count = |start: StartPosition| {
            let mut sub = log.subscribe("application", &start).unwrap();
            drain(&mut sub).len()
        };
        assert_eq!(count(StartPosition::Beginning), 4);
        assert_eq!(count(StartPosition::End), 0);
        assert_eq!(count(StartPosition::AfterRecord(3)), 1);
        assert_eq!(count(StartPosition::Since(t0 + chrono::Duration::minutes(2))), 2);
    }

    #[test]
    fn reads_wake_up_on_write() {
        let log = MemoryEventLog::with_channels(["System"]);
        let mut sub = log.subscribe("System", &StartPosition::End).unwrap();
        let writer = log.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.write("System", EventEntry::report("src", 7, "hello")).unwrap();
        });
        let got = sub.next_batch(10, Duration::from_secs(5)).unwrap();
        t.join().unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].xml.contains("<Data>hello</Data>"));
        assert_eq!(got[0].message.as_deref(), Some("hello"));
    }

    #[test]
    fn missing_and_denied_channels_fail_to_open() {
        let log = MemoryEventLog::with_channels(["Security"]);
        log.deny_access("Security");
        assert!(matches!(
            log.subscribe("nope", &StartPosition::End),
            Err(OpenError::ChannelNotFound(_))
        ));
        assert!(matches!(
            log.subscribe("Security", &StartPosition::End),
            Err(OpenError::AccessDenied(_))
        ));
    }

    #[test]
    fn injected_failures_and_clear_surface_as_errors() {
        let log = MemoryEventLog::with_channels(["Application"]);
        let mut sub = log.subscribe("Application", &StartPosition::Beginning).unwrap();
        log.inject_read_failures("Application", 1);
        assert!(matches!(
            sub.next_batch(1, Duration::ZERO),
            Err(SubscriptionError::Read { .. })
        ));
        log.clear("Application");
        assert!(matches!(
            sub.next_batch(1, Duration::ZERO),
            Err(SubscriptionError::ChannelReset { .. })
        ));
    }

    #[test]
    fn position_tracks_the_last_record_passed() {
        let log = MemoryEventLog::with_channels(["Application"]);
        let mut empty_end = log.subscribe("Application", &StartPosition::End).unwrap();
        assert_eq!(empty_end.position(), Some(0));

        log.write("Application", EventEntry::report("src", 1, "a")).unwrap();
        log.write("Application", EventEntry::report("src", 1, "b")).unwrap();
        let at_end = log.subscribe("Application", &StartPosition::End).unwrap();
        assert_eq!(at_end.position(), Some(2));

        let mut from_start = log.subscribe("Application", &StartPosition::Beginning).unwrap();
        assert_eq!(from_start.position(), Some(0));
        assert_eq!(from_start.next_batch(1, Duration::ZERO).unwrap().len(), 1);
        assert_eq!(from_start.position(), Some(1));

        assert_eq!(drain(&mut empty_end).len(), 2);
        assert_eq!(empty_end.position(), Some(2));
    }

    #[test]
    fn dropped_subscriptions_are_released() {
        let log = MemoryEventLog::with_channels(["Application"]);
        let first = log.subscribe("Application", &StartPosition::End).unwrap();
        let second = log.subscribe("application", &StartPosition::End).unwrap();
        assert_eq!(log.open_subscriptions("Application"), 2);
        drop(first);
        drop(second);
        assert_eq!(log.open_subscriptions("Application"), 0);
    }

    #[test]
    fn values_are_escaped() {
        let log = MemoryEventLog::with_channels(["Application"]);
        log.write("Application", EventEntry::new("a&b", 1).named_data("k", "<x>")).unwrap();
        let mut sub = log.subscribe("Application", &StartPosition::Beginning).unwrap();
        let xml = &drain(&mut sub)[0].xml;
        assert!(xml.contains("Name='a&amp;b'"));
        assert!(xml.contains("<Data Name='k'>&lt;x&gt;</Data>"));
    }
}
