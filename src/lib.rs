// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod delivery;
pub mod filter;
pub mod logging;
pub mod receiver;
pub mod source;
pub mod subscription;

pub use config::ChannelConfig;
pub use decoder::{DecodedEvent, decode};
pub use receiver::{EventLogReceiver, ReceiverBuilder, ReceiverState};
