// src/subscription.rs

//! # Subscription Manager
//!
//! Owns one channel's native subscription and runs the read loop on the
//! worker thread:
//!
//!   next_batch ─▶ decode ─▶ filter ─▶ DeliveryBatch ─▶ on_batch
//!
//! `on_batch` is called synchronously, so a sink that is retrying holds back
//! further native reads. Read errors trigger a resubscribe positioned right
//! after the last record the subscription moved past (or handed to
//! `on_batch`), up to `max_consecutive_failures` times in a row.

use crate::{
    cancel::Cancellation,
    checkpoint::Checkpoint,
    config::{ChannelConfig, Fallback, StartPolicy},
    decoder::decode,
    delivery::{DeliveryBatch, DeliveryError},
    filter::ProviderFilter,
    source::{EventSource, NativeEventRecord, OpenError, StartPosition, Subscription},
};
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;

/// An open subscription plus what is needed to reopen it.
pub struct SubscriptionHandle {
    subscription: Box<dyn Subscription>,
    start: StartPosition,
    last_record: Option<u64>,
}

impl SubscriptionHandle {
    /// Position the subscription was first opened at.
    pub fn start(&self) -> StartPosition {
        self.start
    }

    /// Highest record number handed to `on_batch` so far.
    pub fn last_record(&self) -> Option<u64> {
        self.last_record
    }
}

/// Why the read loop stopped on its own.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("channel '{channel}' failed {failures} consecutive time(s); last error: {reason}")]
    Unrecoverable { channel: String, failures: u32, reason: String },
}

pub struct SubscriptionManager {
    config: Arc<ChannelConfig>,
    source: Arc<dyn EventSource>,
    filter: ProviderFilter,
}

impl SubscriptionManager {
    pub fn new(config: Arc<ChannelConfig>, source: Arc<dyn EventSource>) -> Self {
        let filter = ProviderFilter::new(config.exclude_providers.clone());
        SubscriptionManager { config, source, filter }
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    /// Map the start policy and an optional checkpoint to a native position.
    /// Only the resume policy looks at the checkpoint.
    pub fn resolve_position(&self, checkpoint: Option<&Checkpoint>) -> StartPosition {
        match (&self.config.start_at, checkpoint) {
            (StartPolicy::Beginning, _) => StartPosition::Beginning,
            (StartPolicy::End, _) => StartPosition::End,
            (StartPolicy::Timestamp(t), _) => StartPosition::Since(*t),
            (StartPolicy::Resume { .. }, Some(cp)) => StartPosition::AfterRecord(cp.record_id),
            (StartPolicy::Resume { fallback: Fallback::Beginning }, None) => StartPosition::Beginning,
            (StartPolicy::Resume { fallback: Fallback::End }, None) => StartPosition::End,
        }
    }

    /// Subscribe at the position derived from `checkpoint`.
    pub fn open(&self, checkpoint: Option<&Checkpoint>) -> Result<SubscriptionHandle, OpenError> {
        let start = self.resolve_position(checkpoint);
        let subscription = self.source.subscribe(&self.config.channel, &start)?;
        log::info!("Subscribed to '{}' at {:?}", self.config.channel, start);
        Ok(SubscriptionHandle { subscription, start, last_record: None })
    }

    /// Read until cancelled, delivery fails, or resubscribing gives up.
    pub fn run<F>(
        &self,
        handle: &mut SubscriptionHandle,
        mut on_batch: F,
        cancel: &Cancellation,
    ) -> Result<(), RunError>
    where
        F: FnMut(DeliveryBatch) -> Result<(), DeliveryError>,
    {
        let cfg = &self.config;
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            let records = match handle.subscription.next_batch(cfg.max_reads, cfg.poll_interval) {
                Ok(records) => {
                    failures = 0;
                    records
                }
                Err(e) => {
                    let mut reason = e.to_string();
                    log::warn!("Read from '{}' failed: {}", cfg.channel, reason);
                    loop {
                        failures += 1;
                        if failures > cfg.max_consecutive_failures {
                            log::error!("Giving up on '{}' after {} consecutive failure(s)", cfg.channel, failures);
                            return Err(RunError::Unrecoverable {
                                channel: cfg.channel.clone(),
                                failures,
                                reason,
                            });
                        }
                        if cancel.wait(cfg.resubscribe_delay) {
                            return Ok(());
                        }
                        match self.resubscribe(handle) {
                            Ok(()) => break,
                            Err(open_err) => {
                                reason = open_err.to_string();
                                log::warn!("Resubscribe to '{}' failed: {}", cfg.channel, reason);
                            }
                        }
                    }
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            let batch = self.assemble(records);
            let position = batch.position;
            match on_batch(batch) {
                Ok(()) => {
                    if position.is_some() {
                        handle.last_record = position;
                    }
                }
                Err(DeliveryError::Cancelled) => return Ok(()),
                Err(e) => return Err(RunError::Delivery(e)),
            }
        }
        Ok(())
    }

    /// Release the native subscription.
    pub fn close(&self, handle: SubscriptionHandle) {
        log::info!(
            "Closing subscription to '{}' (last record {:?})",
            self.config.channel,
            handle.last_record
        );
        drop(handle);
    }

    fn resubscribe(&self, handle: &mut SubscriptionHandle) -> Result<(), OpenError> {
        let position = handle
            .last_record
            .max(handle.subscription.position())
            .map_or(handle.start, StartPosition::AfterRecord);
        counter!("eventlog_resubscribes_total", "channel" => self.config.channel.clone()).increment(1);
        log::info!("Resubscribing to '{}' at {:?}", self.config.channel, position);
        handle.subscription = self.source.subscribe(&self.config.channel, &position)?;
        Ok(())
    }

    /// Decode and filter one tick's records, keeping receipt order.
    fn assemble(&self, records: Vec<NativeEventRecord>) -> DeliveryBatch {
        let channel = &self.config.channel;
        let read = records.len();
        let mut batch = DeliveryBatch { events: Vec::with_capacity(read), position: None };

        for record in records {
            let event = decode(record, self.config.raw);
            let id = event.record_id();
            if id > 0 {
                batch.position = batch.position.max(Some(id));
            }
            if self.filter.accept(&event) {
                batch.events.push(event);
            } else {
                log::trace!("Dropped record {} from excluded provider '{}'", id, event.provider());
            }
        }

        let filtered = read - batch.events.len();
        counter!("eventlog_records_read_total", "channel" => channel.clone()).increment(read as u64);
        if filtered > 0 {
            counter!("eventlog_records_filtered_total", "channel" => channel.clone())
                .increment(filtered as u64);
        }
        log::debug!("'{}': read {}, filtered {}, position {:?}", channel, read, filtered, batch.position);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::source::{EventEntry, MemoryEventLog};
    use std::{sync::Mutex, time::Duration};

    fn config(start_at: StartPolicy) -> ChannelConfig {
        let mut cfg = ChannelConfig::new("Application");
        cfg.start_at = start_at;
        cfg.poll_interval = Duration::from_millis(10);
        cfg.resubscribe_delay = Duration::from_millis(5);
        cfg
    }

    #[test]
    fn resume_uses_checkpoint_or_fallback() {
        let log = Arc::new(MemoryEventLog::new());
        let resume_end = SubscriptionManager::new(
            Arc::new(config(StartPolicy::Resume { fallback: Fallback::End })),
            log.clone(),
        );
        let cp = Checkpoint::now("Application", 41);
        assert_eq!(resume_end.resolve_position(Some(&cp)), StartPosition::AfterRecord(41));
        assert_eq!(resume_end.resolve_position(None), StartPosition::End);

        let resume_begin = SubscriptionManager::new(
            Arc::new(config(StartPolicy::Resume { fallback: Fallback::Beginning })),
            log.clone(),
        );
        assert_eq!(resume_begin.resolve_position(None), StartPosition::Beginning);

        let end = SubscriptionManager::new(Arc::new(config(StartPolicy::End)), log);
        assert_eq!(end.resolve_position(Some(&cp)), StartPosition::End);
    }

    #[test]
    fn fully_filtered_ticks_still_report_a_position() {
        let log = Arc::new(MemoryEventLog::with_channels(["Application"]));
        log.write("Application", EventEntry::report("blocked-src", 1, "x")).unwrap();
        log.write("Application", EventEntry::report("blocked-src", 1, "y")).unwrap();

        let mut cfg = config(StartPolicy::Beginning);
        cfg.exclude_providers.insert("blocked-src".into());
        let manager = SubscriptionManager::new(Arc::new(cfg), log);
        let mut handle = manager.open(None).unwrap();

        let (stop, cancel) = cancellation();
        let seen = Mutex::new(Vec::new());
        manager
            .run(
                &mut handle,
                |batch| {
                    seen.lock().unwrap().push((batch.len(), batch.position));
                    stop.cancel();
                    Ok(())
                },
                &cancel,
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(0, Some(2))]);
        assert_eq!(handle.last_record(), Some(2));
    }

    #[test]
    fn too_many_read_failures_end_the_loop() {
        let log = Arc::new(MemoryEventLog::with_channels(["Application"]));
        let mut cfg = config(StartPolicy::End);
        cfg.max_consecutive_failures = 2;
        let manager = SubscriptionManager::new(Arc::new(cfg), log.clone());
        let mut handle = manager.open(None).unwrap();
        log.inject_read_failures("Application", 10);

        let err = manager.run(&mut handle, |_| Ok(()), &Cancellation::never()).unwrap_err();
        assert!(matches!(err, RunError::Unrecoverable { failures: 3, .. }));
    }

    #[test]
    fn resubscribe_at_end_keeps_records_written_after_open() {
        let log = Arc::new(MemoryEventLog::with_channels(["Application"]));
        log.write("Application", EventEntry::report("src", 1, "before")).unwrap();
        let manager = SubscriptionManager::new(Arc::new(config(StartPolicy::End)), log.clone());
        let mut handle = manager.open(None).unwrap();

        log.write("Application", EventEntry::report("src", 1, "after")).unwrap();
        log.inject_read_failures("Application", 1);

        let (stop, cancel) = cancellation();
        let seen = Mutex::new(Vec::new());
        manager
            .run(
                &mut handle,
                |batch| {
                    seen.lock().unwrap().extend(batch.events.iter().map(|e| e.record_id()));
                    stop.cancel();
                    Ok(())
                },
                &cancel,
            )
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn delivery_failure_stops_the_loop() {
        let log = Arc::new(MemoryEventLog::with_channels(["Application"]));
        log.write("Application", EventEntry::report("src", 1, "x")).unwrap();
        let manager = SubscriptionManager::new(Arc::new(config(StartPolicy::Beginning)), log);
        let mut handle = manager.open(None).unwrap();

        let err = manager
            .run(
                &mut handle,
                |_| Err(DeliveryError::Permanent { channel: "Application".into(), attempts: 1, reason: "no".into() }),
                &Cancellation::never(),
            )
            .unwrap_err();
        assert!(matches!(err, RunError::Delivery(_)));
        assert_eq!(handle.last_record(), None);
    }
}
