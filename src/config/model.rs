// src/config/model.rs

//! Configuration structures.
//!
//! Two layers, as usual for the agent: the `*Section` types mirror the TOML
//! file verbatim (strings for durations and start positions), and
//! `ChannelConfig` is the validated, fully-typed form a receiver is built from.

use crate::delivery::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

// ───── TOML mirror ──────────────────────────────────────────────────────────

/// Top-level file as deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub receivers: Vec<ReceiverSection>,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[storage]` table. No path means checkpoints live in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Mirror of the `[metrics]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// `host:port` for the Prometheus scrape endpoint.
    #[serde(default)]
    pub listen: Option<String>,
}

/// Mirror of the `[output]` table. No file means stdout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// One `[[receivers]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverSection {
    pub channel: String,
    #[serde(default = "default_start_at")]
    pub start_at: String,
    #[serde(default)]
    pub resume_fallback: Option<String>,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub exclude_providers: Vec<String>,
    #[serde(default = "default_max_reads")]
    pub max_reads: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_delay: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
    #[serde(default)]
    pub retry_on_failure: RetrySection,
}

fn default_start_at() -> String { "end".into() }
fn default_max_reads() -> usize { 100 }
fn default_poll_interval() -> String { "1s".into() }
fn default_max_failures() -> u32 { 5 }
fn default_resubscribe_delay() -> String { "1s".into() }
fn default_shutdown_timeout() -> String { "10s".into() }

/// Mirror of `[receivers.retry_on_failure]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,
    #[serde(default = "default_max_interval")]
    pub max_interval: String,
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_time: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_true() -> bool { true }
fn default_initial_interval() -> String { "1s".into() }
fn default_max_interval() -> String { "30s".into() }
fn default_max_elapsed() -> String { "5m".into() }
fn default_multiplier() -> f64 { 1.5 }

impl Default for RetrySection {
    fn default() -> Self {
        RetrySection {
            enabled: true,
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            max_elapsed_time: default_max_elapsed(),
            multiplier: default_multiplier(),
        }
    }
}

// ───── runtime types ────────────────────────────────────────────────────────

/// Where a channel without a checkpoint starts when resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Beginning,
    End,
}

/// How a subscription picks its first record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPolicy {
    /// Earliest record still held by the channel.
    Beginning,
    /// Only records created after subscribing.
    End,
    /// Right after the checkpointed record, or `fallback` without one.
    Resume { fallback: Fallback },
    /// First record created at or after the instant.
    Timestamp(DateTime<Utc>),
}

impl StartPolicy {
    pub fn resumes(&self) -> bool {
        matches!(self, StartPolicy::Resume { .. })
    }
}

/// Allow `"beginning"`, `"end"`, `"resume"` or an RFC 3339 timestamp.
impl FromStr for StartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "beginning" => Ok(StartPolicy::Beginning),
            "end"       => Ok(StartPolicy::End),
            "resume"    => Ok(StartPolicy::Resume { fallback: Fallback::End }),
            _ => DateTime::parse_from_rfc3339(s.trim())
                .map(|ts| StartPolicy::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| ConfigError::InvalidStartAt(s.into())),
        }
    }
}

impl FromStr for Fallback {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "beginning" => Ok(Fallback::Beginning),
            "end"       => Ok(Fallback::End),
            other       => Err(ConfigError::InvalidResumeFallback(other.into())),
        }
    }
}

/// Fully-typed, immutable configuration of one channel receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub channel: String,
    pub start_at: StartPolicy,
    pub raw: bool,
    pub exclude_providers: BTreeSet<String>,
    pub max_reads: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: u32,
    pub resubscribe_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl ChannelConfig {
    /// Defaults for `channel`: start at the end, structured output, no exclusions.
    pub fn new(channel: impl Into<String>) -> Self {
        ChannelConfig {
            channel: channel.into(),
            start_at: StartPolicy::End,
            raw: false,
            exclude_providers: BTreeSet::new(),
            max_reads: default_max_reads(),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            max_consecutive_failures: default_max_failures(),
            resubscribe_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl TryFrom<ReceiverSection> for ChannelConfig {
    type Error = ConfigError;

    fn try_from(raw: ReceiverSection) -> Result<Self, Self::Error> {
        let channel = raw.channel.trim().to_string();
        if channel.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }

        let mut start_at: StartPolicy = raw.start_at.parse()?;
        match (&mut start_at, &raw.resume_fallback) {
            (StartPolicy::Resume { fallback }, Some(fb)) => *fallback = fb.parse()?,
            (_, Some(_)) => return Err(ConfigError::FallbackWithoutResume { channel }),
            (_, None) => {}
        }

        let mut exclude_providers = BTreeSet::new();
        for provider in raw.exclude_providers {
            if provider.trim().is_empty() {
                return Err(ConfigError::EmptyProvider { channel });
            }
            exclude_providers.insert(provider);
        }

        if raw.max_reads == 0 {
            return Err(ConfigError::InvalidMaxReads);
        }

        let retry = RetryPolicy {
            enabled: raw.retry_on_failure.enabled,
            initial_interval: parse_duration(&raw.retry_on_failure.initial_interval)?,
            max_interval: parse_duration(&raw.retry_on_failure.max_interval)?,
            max_elapsed_time: parse_duration(&raw.retry_on_failure.max_elapsed_time)?,
            multiplier: raw.retry_on_failure.multiplier,
        };
        retry.validate()?;

        Ok(ChannelConfig {
            channel,
            start_at,
            raw: raw.raw,
            exclude_providers,
            max_reads: raw.max_reads,
            poll_interval: parse_duration(&raw.poll_interval)?,
            retry,
            max_consecutive_failures: raw.max_consecutive_failures,
            resubscribe_delay: parse_duration(&raw.resubscribe_delay)?,
            shutdown_timeout: parse_duration(&raw.shutdown_timeout)?,
        })
    }
}

/// Parse a humantime string such as `"250ms"` or `"5m"`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s.trim()).map_err(|e| ConfigError::InvalidDuration(s.into(), e))
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid start_at '{0}': expected beginning, end, resume or an RFC 3339 timestamp")]
    InvalidStartAt(String),

    #[error("invalid resume_fallback '{0}': expected beginning or end")]
    InvalidResumeFallback(String),

    #[error("resume_fallback for channel '{channel}' requires start_at = \"resume\"")]
    FallbackWithoutResume { channel: String },

    #[error("receiver channel name must not be empty")]
    EmptyChannel,

    #[error("exclude_providers for channel '{channel}' contains an empty provider name")]
    EmptyProvider { channel: String },

    #[error("max_reads must be at least 1")]
    InvalidMaxReads,

    #[error("invalid retry_on_failure: {0}")]
    InvalidRetry(String),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
