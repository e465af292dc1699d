// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the agent's TOML file, deserializes it into `MasterConfig`, and
//! converts every `[[receivers]]` entry into a validated `ChannelConfig`.
//! Validation happens here, before any receiver exists, so a bad `start_at`
//! never reaches the native subscription code.

use crate::config::model::{ChannelConfig, ConfigError, MasterConfig};
use std::{fs, path::Path};

/// Load and parse the master configuration from `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: &Path) -> Result<(MasterConfig, Vec<ChannelConfig>), ConfigError> {
    log::debug!("Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let loaded = load_str(&txt)?;
    log::info!("Loaded config from {:?} ({} receiver(s))", path, loaded.1.len());
    Ok(loaded)
}

/// Parse configuration text; split out for tests and embedded defaults.
pub fn load_str(txt: &str) -> Result<(MasterConfig, Vec<ChannelConfig>), ConfigError> {
    let master: MasterConfig = toml::from_str(txt)?;
    let channels = master
        .receivers
        .iter()
        .cloned()
        .map(ChannelConfig::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    for cfg in &channels {
        log::debug!(
            "Receiver '{}': start_at={:?}, raw={}, {} excluded provider(s), poll={:?}",
            cfg.channel,
            cfg.start_at,
            cfg.raw,
            cfg.exclude_providers.len(),
            cfg.poll_interval
        );
    }
    Ok((master, channels))
}
