// src/receiver.rs

//! # Receiver Lifecycle
//!
//! One `EventLogReceiver` per channel. `start` opens the checkpoint store,
//! reads the checkpoint, subscribes and hands the subscription to a blocking
//! worker; `shutdown` cancels the worker and waits for it up to the
//! configured timeout.
//!
//!   Created ─▶ Starting ─▶ Running ─▶ Stopping ─▶ Stopped
//!                 │           │
//!                 └──────┬────┘
//!                        ▼
//!                     Failed
//!
//! `start` and `shutdown` are serialized by an async mutex. The observable
//! state lives in a plain mutex shared with the worker, which marks the
//! receiver `Failed` when its loop ends with an error.

use crate::{
    cancel::{CancelHandle, cancellation},
    checkpoint::{MemoryStore, PositionStore, StoreError, open_store},
    config::{ChannelConfig, model::StorageConfig},
    delivery::{DeliveryPipeline, LogSink},
    source::{EventSource, OpenError},
    subscription::SubscriptionManager,
};
use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Start failed or the worker stopped on an error.
    Failed(String),
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverState::Created => f.write_str("created"),
            ReceiverState::Starting => f.write_str("starting"),
            ReceiverState::Running => f.write_str("running"),
            ReceiverState::Stopping => f.write_str("stopping"),
            ReceiverState::Stopped => f.write_str("stopped"),
            ReceiverState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("receiver for '{channel}' cannot start while {state}")]
    InvalidState { channel: String, state: ReceiverState },

    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Open(#[from] OpenError),
}

enum StoreSource {
    Ready(Arc<dyn PositionStore>),
    Open { base_dir: PathBuf, cfg: StorageConfig },
}

pub struct ReceiverBuilder {
    config: ChannelConfig,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn LogSink>,
    store: StoreSource,
}

impl ReceiverBuilder {
    pub fn new(config: ChannelConfig, source: Arc<dyn EventSource>, sink: Arc<dyn LogSink>) -> Self {
        ReceiverBuilder {
            config,
            source,
            sink,
            store: StoreSource::Ready(Arc::new(MemoryStore::default())),
        }
    }

    /// Use an already opened store.
    pub fn store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.store = StoreSource::Ready(store);
        self
    }

    /// Open the store from `[storage]` when the receiver starts.
    pub fn storage(mut self, base_dir: impl Into<PathBuf>, cfg: StorageConfig) -> Self {
        self.store = StoreSource::Open { base_dir: base_dir.into(), cfg };
        self
    }

    pub fn build(self) -> EventLogReceiver {
        EventLogReceiver {
            config: Arc::new(self.config),
            source: self.source,
            sink: self.sink,
            store: self.store,
            state: Arc::new(Mutex::new(ReceiverState::Created)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }
}

struct Running {
    cancel: CancelHandle,
    worker: JoinHandle<()>,
}

pub struct EventLogReceiver {
    config: Arc<ChannelConfig>,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn LogSink>,
    store: StoreSource,
    state: Arc<Mutex<ReceiverState>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

fn set_state(state: &Mutex<ReceiverState>, next: ReceiverState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Worker-side failure. A receiver that already stopped keeps its state.
fn fail_if_active(state: &Mutex<ReceiverState>, reason: String) -> bool {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    let active = matches!(*current, ReceiverState::Running | ReceiverState::Stopping);
    if active {
        *current = ReceiverState::Failed(reason);
    }
    active
}

impl EventLogReceiver {
    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    pub fn state(&self) -> ReceiverState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ReceiverState::Running
    }

    /// Subscribe and spawn the worker. Errors leave the receiver `Failed`.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != ReceiverState::Created {
            return Err(StartError::InvalidState { channel: self.config.channel.clone(), state: current });
        }
        set_state(&self.state, ReceiverState::Starting);
        log::info!("Starting receiver for '{}'", self.config.channel);

        match self.launch() {
            Ok(running) => {
                *lifecycle = Some(running);
                Ok(())
            }
            Err(e) => {
                log::error!("Receiver for '{}' failed to start: {}", self.config.channel, e);
                set_state(&self.state, ReceiverState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Running, StartError> {
        let store = match &self.store {
            StoreSource::Ready(store) => Arc::clone(store),
            StoreSource::Open { base_dir, cfg } => open_store(base_dir, cfg)?,
        };

        let channel = &self.config.channel;
        let checkpoint = if self.config.start_at.resumes() {
            store.load(channel).unwrap_or_else(|e| {
                log::warn!("Could not read checkpoint for '{}', using fallback: {}", channel, e);
                None
            })
        } else {
            None
        };
        if let Some(cp) = &checkpoint {
            log::info!("Resuming '{}' after record {} (saved {})", channel, cp.record_id, cp.updated_at);
        }

        let manager = SubscriptionManager::new(Arc::clone(&self.config), Arc::clone(&self.source));
        let mut handle = manager.open(checkpoint.as_ref())?;

        let (cancel_handle, cancel) = cancellation();
        let pipeline = DeliveryPipeline::new(
            channel.clone(),
            Arc::clone(&self.sink),
            store,
            self.config.retry.clone(),
            cancel.clone(),
        );

        // Running before the worker exists, so an early failure is not overwritten.
        set_state(&self.state, ReceiverState::Running);
        let state = Arc::clone(&self.state);
        let worker = tokio::task::spawn_blocking(move || {
            let result = manager.run(&mut handle, |batch| pipeline.deliver(batch), &cancel);
            manager.close(handle);
            if let Err(e) = result {
                log::error!("Receiver for '{}' stopped: {}", manager.channel(), e);
                if !fail_if_active(&state, e.to_string()) {
                    log::warn!("Receiver for '{}' already stopped; keeping its state", manager.channel());
                }
            }
        });

        log::info!("Receiver for '{}' running", channel);
        Ok(Running { cancel: cancel_handle, worker })
    }

    /// Stop the worker. Waits at most `shutdown_timeout`; a worker that is
    /// still busy closes its subscription when it finally exits.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            if self.state() == ReceiverState::Created {
                set_state(&self.state, ReceiverState::Stopped);
            }
            return;
        };

        if self.state() == ReceiverState::Running {
            set_state(&self.state, ReceiverState::Stopping);
        }
        log::info!("Stopping receiver for '{}'", self.config.channel);
        running.cancel.cancel();

        match tokio::time::timeout(self.config.shutdown_timeout, running.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("Worker for '{}' panicked: {}", self.config.channel, e);
                set_state(&self.state, ReceiverState::Failed(format!("worker panicked: {e}")));
            }
            Err(_) => log::warn!(
                "Worker for '{}' did not stop within {:?}; detaching it",
                self.config.channel,
                self.config.shutdown_timeout
            ),
        }

        if self.state() == ReceiverState::Stopping {
            set_state(&self.state, ReceiverState::Stopped);
        }
        log::info!("Receiver for '{}' is {}", self.config.channel, self.state());
    }
}

impl Drop for EventLogReceiver {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut() {
            running.cancel.cancel();
        }
    }
}
