// src/source/mod.rs

//! Native event source abstraction.
//!
//! Key responsibilities:
//! - Describe a channel subscription as a pull API (`next_batch`) so a single
//!   worker thread owns the native handle and no OS callback thread ever blocks.
//! - Translate a resolved start position into the backend's own seek semantics.
//! - Report open failures and mid-stream failures as distinct error types.
//!
//! Backends: `wevtapi` (Windows only) and `memory` (tests, non-Windows builds).

pub mod memory;
#[cfg(windows)]
pub mod wevtapi;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use memory::{EventEntry, MemoryEventLog};

/// One OS event as handed over by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEventRecord {
    /// Rendered event XML (`<Event xmlns=...>`).
    pub xml: String,
    /// Message text from the provider's catalog, if the backend resolved one.
    pub message: Option<String>,
}

/// Where a new subscription begins, after the start policy was resolved
/// against the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    End,
    /// First record whose number is greater than the given one.
    AfterRecord(u64),
    /// First record created at or after the instant.
    Since(DateTime<Utc>),
}

/// Opens subscriptions against named channels.
pub trait EventSource: Send + Sync + 'static {
    fn subscribe(
        &self,
        channel: &str,
        start: &StartPosition,
    ) -> Result<Box<dyn Subscription>, OpenError>;
}

/// A live subscription. Dropping it unsubscribes and releases native handles.
pub trait Subscription: Send {
    /// Return up to `max` records, waiting at most `wait` for the first one.
    /// An empty vector means nothing arrived in time.
    fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<NativeEventRecord>, SubscriptionError>;

    /// Highest record number this subscription has moved past: read, or
    /// already present when it was opened at the end. Resubscribing after it
    /// loses nothing. `None` when the backend cannot tell.
    fn position(&self) -> Option<u64>;
}

/// Failures while opening a subscription; fatal at receiver start.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("channel '{0}' does not exist")]
    ChannelNotFound(String),

    #[error("access to channel '{0}' denied")]
    AccessDenied(String),

    #[error("failed to subscribe to '{channel}' (code {code}): {message}")]
    Native { channel: String, code: u32, message: String },
}

/// Failures on an open subscription; the manager resubscribes on these.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("channel '{channel}' was reset or cleared")]
    ChannelReset { channel: String },

    #[error("read from '{channel}' failed: {message}")]
    Read { channel: String, message: String },
}
