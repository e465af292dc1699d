// src/source/wevtapi.rs

//! Windows Event Log backend (`wevtapi.dll`).
//!
//! A pull subscription: `EvtSubscribe` is called with a manual-reset signal
//! event and no callback, so records are fetched with `EvtNext` from the
//! worker thread that owns the subscription. Each record is rendered as XML
//! (`EvtRender`) and its message is resolved through the provider's
//! publisher metadata (`EvtFormatMessage`, user default locale).
//!
//! All native handles are owned by RAII wrappers and closed on drop.

use super::{EventSource, NativeEventRecord, OpenError, StartPosition, Subscription, SubscriptionError};
use crate::decoder::{peek_provider, peek_record_id};
use std::{collections::HashMap, ffi::OsStr, io, os::windows::prelude::OsStrExt, ptr, time::Duration};
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_EVT_CHANNEL_NOT_FOUND,
        ERROR_EVT_QUERY_RESULT_STALE, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, HANDLE,
        WAIT_OBJECT_0, WAIT_TIMEOUT,
    },
    System::{
        EventLog::{
            EvtClose, EvtFormatMessage, EvtFormatMessageEvent, EvtNext, EvtOpenPublisherMetadata,
            EvtQuery, EvtQueryChannelPath, EvtQueryReverseDirection, EvtRender, EvtRenderEventXml,
            EvtSubscribe, EvtSubscribeStartAtOldestRecord, EvtSubscribeToFutureEvents, EVT_HANDLE,
        },
        Threading::{CreateEventW, ResetEvent, WaitForSingleObject},
    },
};

/// Returned by `EvtFormatMessage` when some inserts could not be resolved;
/// the buffer still holds a usable message.
const ERROR_EVT_UNRESOLVED_VALUE_INSERT: u32 = 15029;

/// Null-terminated UTF-16 for Win32 calls.
fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

fn last_error() -> u32 {
    unsafe { GetLastError() }
}

fn describe(code: u32) -> String {
    io::Error::from_raw_os_error(code as i32).to_string()
}

/// Owns one `EVT_HANDLE`.
struct EvtGuard(EVT_HANDLE);

// Event log handles are not tied to the creating thread.
unsafe impl Send for EvtGuard {}

impl EvtGuard {
    fn is_null(&self) -> bool {
        self.0 == 0 as EVT_HANDLE
    }
}

impl Drop for EvtGuard {
    fn drop(&mut self) {
        if !self.is_null() {
            unsafe { EvtClose(self.0) };
        }
    }
}

// ───── source ───────────────────────────────────────────────────────────────

/// The local machine's event log.
#[derive(Debug, Default, Clone, Copy)]
pub struct WevtapiSource;

impl WevtapiSource {
    pub fn new() -> Self {
        WevtapiSource
    }
}

/// XPath query and subscribe flags for a start position.
fn query_for(start: &StartPosition) -> (String, u32) {
    match start {
        StartPosition::Beginning => ("*".into(), EvtSubscribeStartAtOldestRecord as u32),
        StartPosition::End => ("*".into(), EvtSubscribeToFutureEvents as u32),
        StartPosition::AfterRecord(n) => (
            format!("*[System[EventRecordID > {n}]]"),
            EvtSubscribeStartAtOldestRecord as u32,
        ),
        StartPosition::Since(t) => (
            format!(
                "*[System[TimeCreated[@SystemTime >= '{}']]]",
                t.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ),
            EvtSubscribeStartAtOldestRecord as u32,
        ),
    }
}

impl EventSource for WevtapiSource {
    fn subscribe(
        &self,
        channel: &str,
        start: &StartPosition,
    ) -> Result<Box<dyn Subscription>, OpenError> {
        // Taken before subscribing: records landing in between are read
        // again after a resubscribe rather than skipped.
        let passed = match start {
            StartPosition::End => newest_record(channel),
            StartPosition::AfterRecord(n) => Some(*n),
            StartPosition::Beginning | StartPosition::Since(_) => None,
        };

        // Manual reset, initially signalled so the first read polls immediately.
        let signal = unsafe { CreateEventW(ptr::null(), 1, 1, ptr::null()) };
        if signal == 0 as HANDLE {
            let code = last_error();
            return Err(OpenError::Native { channel: channel.into(), code, message: describe(code) });
        }

        let (query, flags) = query_for(start);
        let channel_w = wide(channel);
        let query_w = wide(&query);
        let handle = unsafe {
            EvtSubscribe(
                0 as EVT_HANDLE,
                signal,
                channel_w.as_ptr(),
                query_w.as_ptr(),
                0 as EVT_HANDLE,
                ptr::null(),
                None,
                flags,
            )
        };
        if handle == 0 as EVT_HANDLE {
            let code = last_error();
            unsafe { CloseHandle(signal) };
            return Err(match code {
                ERROR_EVT_CHANNEL_NOT_FOUND => OpenError::ChannelNotFound(channel.into()),
                ERROR_ACCESS_DENIED => OpenError::AccessDenied(channel.into()),
                _ => OpenError::Native { channel: channel.into(), code, message: describe(code) },
            });
        }

        log::debug!("EvtSubscribe('{}', {:?}) query={}", channel, start, query);
        Ok(Box::new(WevtSubscription {
            channel: channel.into(),
            signal,
            handle: EvtGuard(handle),
            publishers: HashMap::new(),
            passed,
        }))
    }
}

// ───── subscription ─────────────────────────────────────────────────────────

struct WevtSubscription {
    channel: String,
    signal: HANDLE,
    handle: EvtGuard,
    /// Publisher metadata per provider; a null guard remembers a failed open.
    publishers: HashMap<String, EvtGuard>,
    passed: Option<u64>,
}

// The signal event is only waited on by the owning worker.
unsafe impl Send for WevtSubscription {}

impl Subscription for WevtSubscription {
    fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<NativeEventRecord>, SubscriptionError> {
        let wait_ms = u32::try_from(wait.as_millis()).unwrap_or(u32::MAX);
        match unsafe { WaitForSingleObject(self.signal, wait_ms) } {
            WAIT_OBJECT_0 => {}
            WAIT_TIMEOUT => return Ok(Vec::new()),
            _ => {
                let code = last_error();
                return Err(SubscriptionError::Read { channel: self.channel.clone(), message: describe(code) });
            }
        }

        let mut raw = vec![0 as EVT_HANDLE; max.max(1)];
        let mut returned = 0u32;
        let ok = unsafe {
            EvtNext(self.handle.0, raw.len() as u32, raw.as_mut_ptr(), 0, 0, &mut returned)
        };
        if ok == 0 {
            return match last_error() {
                ERROR_NO_MORE_ITEMS => {
                    unsafe { ResetEvent(self.signal) };
                    Ok(Vec::new())
                }
                ERROR_EVT_QUERY_RESULT_STALE => {
                    Err(SubscriptionError::ChannelReset { channel: self.channel.clone() })
                }
                code => Err(SubscriptionError::Read { channel: self.channel.clone(), message: describe(code) }),
            };
        }

        let events: Vec<EvtGuard> = raw.into_iter().take(returned as usize).map(EvtGuard).collect();
        let mut batch = Vec::with_capacity(events.len());
        for event in &events {
            let xml = match render_xml(event) {
                Ok(xml) => xml,
                Err(code) => {
                    return Err(SubscriptionError::Read {
                        channel: self.channel.clone(),
                        message: format!("EvtRender: {}", describe(code)),
                    })
                }
            };
            let message = peek_provider(&xml).and_then(|p| self.format_message(&p, event));
            batch.push(NativeEventRecord { xml, message });
        }
        if let Some(last) = batch.last().map(|r| peek_record_id(&r.xml)).filter(|&id| id > 0) {
            self.passed = Some(last);
        }
        Ok(batch)
    }

    fn position(&self) -> Option<u64> {
        self.passed
    }
}

impl WevtSubscription {
    fn format_message(&mut self, provider: &str, event: &EvtGuard) -> Option<String> {
        let publisher = self.publishers.entry(provider.to_string()).or_insert_with(|| {
            let name = wide(provider);
            let h = unsafe {
                EvtOpenPublisherMetadata(0 as EVT_HANDLE, name.as_ptr(), ptr::null(), 0, 0)
            };
            if h == 0 as EVT_HANDLE {
                log::debug!("no publisher metadata for '{}': {}", provider, describe(last_error()));
            }
            EvtGuard(h)
        });
        if publisher.is_null() {
            return None;
        }

        let mut used = 0u32;
        let flags = EvtFormatMessageEvent as u32;
        let ok = unsafe {
            EvtFormatMessage(publisher.0, event.0, 0, 0, ptr::null(), flags, 0, ptr::null_mut(), &mut used)
        };
        if ok != 0 || last_error() != ERROR_INSUFFICIENT_BUFFER {
            return None;
        }

        let mut buf = vec![0u16; used as usize];
        let ok = unsafe {
            EvtFormatMessage(publisher.0, event.0, 0, 0, ptr::null(), flags, used, buf.as_mut_ptr(), &mut used)
        };
        if ok == 0 && last_error() != ERROR_EVT_UNRESOLVED_VALUE_INSERT {
            return None;
        }
        Some(from_wide(&buf))
    }
}

/// Record number of the newest event in `channel`; `Some(0)` for an empty log.
fn newest_record(channel: &str) -> Option<u64> {
    let channel_w = wide(channel);
    let query_w = wide("*");
    let flags = (EvtQueryChannelPath | EvtQueryReverseDirection) as u32;
    let query = EvtGuard(unsafe { EvtQuery(0 as EVT_HANDLE, channel_w.as_ptr(), query_w.as_ptr(), flags) });
    if query.is_null() {
        log::debug!("cannot query tail of '{}': {}", channel, describe(last_error()));
        return None;
    }

    let mut raw = [0 as EVT_HANDLE; 1];
    let mut returned = 0u32;
    let ok = unsafe { EvtNext(query.0, 1, raw.as_mut_ptr(), 1_000, 0, &mut returned) };
    if ok == 0 {
        return match last_error() {
            ERROR_NO_MORE_ITEMS => Some(0),
            code => {
                log::debug!("cannot read tail of '{}': {}", channel, describe(code));
                None
            }
        };
    }
    let event = EvtGuard(raw[0]);
    render_xml(&event).ok().map(|xml| peek_record_id(&xml))
}

/// Two-pass `EvtRender` into an owned string.
fn render_xml(event: &EvtGuard) -> Result<String, u32> {
    let flags = EvtRenderEventXml as u32;
    let mut used = 0u32;
    let mut props = 0u32;
    let ok = unsafe { EvtRender(0 as EVT_HANDLE, event.0, flags, 0, ptr::null_mut(), &mut used, &mut props) };
    if ok != 0 {
        return Ok(String::new());
    }
    let code = last_error();
    if code != ERROR_INSUFFICIENT_BUFFER {
        return Err(code);
    }

    // `used` is in bytes.
    let mut buf = vec![0u16; (used as usize).div_ceil(2)];
    let ok = unsafe {
        EvtRender(
            0 as EVT_HANDLE,
            event.0,
            flags,
            (buf.len() * 2) as u32,
            buf.as_mut_ptr().cast(),
            &mut used,
            &mut props,
        )
    };
    if ok == 0 {
        return Err(last_error());
    }
    Ok(from_wide(&buf))
}

impl Drop for WevtSubscription {
    fn drop(&mut self) {
        // Subscription first; it may still signal the event.
        drop(std::mem::replace(&mut self.handle, EvtGuard(0 as EVT_HANDLE)));
        self.publishers.clear();
        unsafe { CloseHandle(self.signal) };
        log::debug!("unsubscribed from '{}'", self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn queries_follow_start_position() {
        assert_eq!(query_for(&StartPosition::Beginning).0, "*");
        assert_eq!(query_for(&StartPosition::AfterRecord(42)).0, "*[System[EventRecordID > 42]]");
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            query_for(&StartPosition::Since(t)).0,
            "*[System[TimeCreated[@SystemTime >= '2024-03-01T10:00:00.000Z']]]"
        );
    }

    #[test]
    fn missing_channel_is_reported() {
        let err = WevtapiSource::new()
            .subscribe("Definitely-Not-A-Channel/Operational", &StartPosition::End)
            .err()
            .unwrap();
        assert!(matches!(err, OpenError::ChannelNotFound(_)));
    }
}
