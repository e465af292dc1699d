// src/delivery/mod.rs

//! # Delivery Pipeline
//!
//! Hands accepted events to the sink and records progress.
//!
//! Key responsibilities:
//! - Convert a `DeliveryBatch` into `LogRecord`s in batch order.
//! - Retry transient sink failures with exponential backoff; the backoff
//!   sleep is interrupted by cancellation.
//! - Save a checkpoint only after the sink confirmed the batch. A failed
//!   save is logged and counted, never fatal: the batch is re-delivered
//!   after a restart instead of being skipped.

pub mod retry;
pub mod sink;

pub use retry::{Backoff, RetryPolicy};
pub use sink::{Body, JsonLinesSink, LogRecord, LogSink, Severity, SinkError};

use crate::{
    cancel::Cancellation,
    checkpoint::{Checkpoint, PositionStore},
    decoder::DecodedEvent,
};
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;

/// Events accepted during one poll tick, in receipt order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryBatch {
    pub events: Vec<DecodedEvent>,
    /// Highest record number seen in the tick, filtered records included.
    pub position: Option<u64>,
}

impl DeliveryBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery to sink failed for '{channel}' after {attempts} attempt(s): {reason}")]
    Permanent { channel: String, attempts: u32, reason: String },

    #[error("delivery cancelled")]
    Cancelled,
}

pub struct DeliveryPipeline {
    channel: String,
    sink: Arc<dyn LogSink>,
    store: Arc<dyn PositionStore>,
    policy: RetryPolicy,
    cancel: Cancellation,
}

impl DeliveryPipeline {
    pub fn new(
        channel: impl Into<String>,
        sink: Arc<dyn LogSink>,
        store: Arc<dyn PositionStore>,
        policy: RetryPolicy,
        cancel: Cancellation,
    ) -> Self {
        DeliveryPipeline { channel: channel.into(), sink, store, policy, cancel }
    }

    /// Deliver `batch`, then checkpoint its position.
    pub fn deliver(&self, batch: DeliveryBatch) -> Result<(), DeliveryError> {
        if !batch.is_empty() {
            let observed = Utc::now();
            let records: Vec<LogRecord> =
                batch.events.iter().map(|e| LogRecord::from_event(e, observed)).collect();
            self.send_with_retry(&records)?;
            counter!("eventlog_records_delivered_total", "channel" => self.channel.clone())
                .increment(records.len() as u64);
        }

        if let Some(record_id) = batch.position {
            self.save_checkpoint(record_id);
        }
        Ok(())
    }

    fn send_with_retry(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let reason = match self.sink.consume(records) {
                Ok(()) => return Ok(()),
                Err(SinkError::Permanent(reason)) => return Err(self.give_up(attempts, reason)),
                Err(SinkError::Transient(reason)) => reason,
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(self.give_up(attempts, reason));
            };
            log::warn!(
                "Sink rejected {} record(s) from '{}' (attempt {}): {}; retrying in {:?}",
                records.len(),
                self.channel,
                attempts,
                reason,
                delay
            );
            counter!("eventlog_delivery_retries_total", "channel" => self.channel.clone()).increment(1);

            if self.cancel.wait(delay) {
                log::info!("Retry for '{}' interrupted by shutdown; batch not checkpointed", self.channel);
                return Err(DeliveryError::Cancelled);
            }
        }
    }

    fn give_up(&self, attempts: u32, reason: String) -> DeliveryError {
        log::error!("Giving up on batch for '{}' after {} attempt(s): {}", self.channel, attempts, reason);
        counter!("eventlog_delivery_failures_total", "channel" => self.channel.clone()).increment(1);
        DeliveryError::Permanent { channel: self.channel.clone(), attempts, reason }
    }

    fn save_checkpoint(&self, record_id: u64) {
        let checkpoint = Checkpoint::now(self.channel.clone(), record_id);
        match self.store.save(&checkpoint) {
            Ok(()) => log::trace!("Checkpoint '{}' -> {}", self.channel, record_id),
            Err(e) => {
                log::error!("Failed to save checkpoint {} for '{}': {}", record_id, self.channel, e);
                counter!("eventlog_checkpoint_failures_total", "channel" => self.channel.clone())
                    .increment(1);
            }
        }
    }
}
