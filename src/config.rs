//! Loader configuration.
//!
//! [`LoaderConfig`] gathers every recognized option of a run. It can be built in code
//! (`LoaderConfig::default()` plus the `with_*` methods) or read from a JSON file with
//! [`LoaderConfig::from_json_file`]; missing fields take their defaults. The
//! orchestrator calls [`LoaderConfig::validate`] before any input is read, so a bad
//! option never costs a partial load.
//!
//! # Example
//!
//! ```
//! use ringload::config::{LoaderConfig, MalformedPolicy};
//!
//! let cfg = LoaderConfig::default()
//!     .with_separator('\t')
//!     .with_consumers(4)
//!     .with_ring_capacity(256)
//!     .with_malformed_policy(MalformedPolicy::SkipAndCount);
//! assert!(cfg.validate().is_ok());
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest window the mapped reader maps at once by default.
pub const DEFAULT_MAX_WINDOW_BYTES: u64 = i32::MAX as u64;

/// Startup-time configuration failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{option} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo { option: &'static str, value: usize },

    #[error("ring capacity {capacity} is smaller than the consumer count {consumers}")]
    CapacityBelowConsumers { capacity: usize, consumers: usize },

    #[error("separator {0:?} is not a single-byte character")]
    Separator(char),

    #[error("invalid {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    #[error("input {} has no first line to infer the column count from", .0.display())]
    EmptyInput(PathBuf),

    #[error("input has {inferred} columns but the statement binds {declared}")]
    ArityMismatch { inferred: usize, declared: usize },
}

/// Which record source implementation reads the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderKind {
    /// Memory-mapped windows over the file (plain files only).
    #[default]
    Mapped,
    /// Buffered streaming reads, with transparent decompression.
    Buffered,
}

/// What a consumer does with a row whose values do not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Abort the whole run on the first malformed row.
    #[default]
    FailFast,
    /// Log the row, count it, and keep loading.
    SkipAndCount,
}

/// How a thread waits when the ring cannot make progress for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Spin on the CPU. Lowest latency, burns a core per waiting thread.
    BusySpin,
    /// Spin briefly, then yield the time slice.
    Yielding,
    /// Spin, then yield, then sleep in short intervals.
    Phased {
        spin_tries: u32,
        yield_tries: u32,
        sleep_us: u64,
    },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::Phased {
            spin_tries: 64,
            yield_tries: 64,
            sleep_us: 100,
        }
    }
}

/// Retry policy for transient sink failures.
///
/// The first retry waits `base_delay_ms`, each further retry doubles the delay, capped
/// at `max_delay_ms`. A batch is attempted at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// All options of a load run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Field separator; must encode to a single byte.
    pub separator: char,
    /// Number of consumer threads, a power of two.
    pub consumers: usize,
    /// Number of ring slots, a power of two no smaller than `consumers`.
    pub ring_capacity: usize,
    pub reader: ReaderKind,
    /// Largest byte range the mapped reader maps at once.
    pub max_window_bytes: u64,
    pub producer_wait: WaitStrategy,
    pub consumer_wait: WaitStrategy,
    pub retry: RetryConfig,
    pub malformed: MalformedPolicy,
    /// Flush early once a batch holds this many rows.
    pub max_batch_rows: Option<usize>,
    /// Per-consumer progress log cadence in records; 0 disables it.
    pub progress_interval: u64,
    /// Where to write the run's metrics as JSON.
    pub metrics_path: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            separator: ',',
            consumers: 16,
            ring_capacity: 1024,
            reader: ReaderKind::default(),
            max_window_bytes: DEFAULT_MAX_WINDOW_BYTES,
            producer_wait: WaitStrategy::default(),
            consumer_wait: WaitStrategy::default(),
            retry: RetryConfig::default(),
            malformed: MalformedPolicy::default(),
            max_batch_rows: None,
            progress_interval: 4096,
            metrics_path: None,
        }
    }
}

impl LoaderConfig {
    /// Read a configuration from a JSON file. Fields left out keep their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or is not a valid configuration.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let cfg: Self = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse loader config {}", path.display()))?;
        Ok(cfg)
    }

    #[must_use]
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    #[must_use]
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    #[must_use]
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_reader(mut self, reader: ReaderKind) -> Self {
        self.reader = reader;
        self
    }

    #[must_use]
    pub fn with_max_window_bytes(mut self, bytes: u64) -> Self {
        self.max_window_bytes = bytes;
        self
    }

    /// Use the same wait strategy for the producer and the consumers.
    #[must_use]
    pub fn with_wait_strategy(mut self, wait: WaitStrategy) -> Self {
        self.producer_wait = wait;
        self.consumer_wait = wait;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }

    #[must_use]
    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = Some(rows);
        self
    }

    #[must_use]
    pub fn with_metrics_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    /// The separator as the byte the scanner matches on.
    ///
    /// # Errors
    /// Returns [`ConfigError::Separator`] for characters outside ASCII and for the
    /// newline, which is reserved as the record terminator.
    pub fn separator_byte(&self) -> Result<u8, ConfigError> {
        if self.separator.is_ascii() && self.separator != '\n' {
            Ok(self.separator as u8)
        } else {
            Err(ConfigError::Separator(self.separator))
        }
    }

    /// Check every option. Called by the loader before opening the input.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.separator_byte()?;
        if !self.consumers.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                option: "consumers",
                value: self.consumers,
            });
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                option: "ring_capacity",
                value: self.ring_capacity,
            });
        }
        if self.ring_capacity < self.consumers {
            return Err(ConfigError::CapacityBelowConsumers {
                capacity: self.ring_capacity,
                consumers: self.consumers,
            });
        }
        if self.max_window_bytes == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_window_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_batch_rows == Some(0) {
            return Err(ConfigError::InvalidOption {
                option: "max_batch_rows",
                reason: "must be greater than zero when set".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidOption {
                option: "retry",
                reason: format!(
                    "base delay {}ms exceeds max delay {}ms",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }
        let cpus = num_cpus::get();
        if self.consumers > cpus {
            log::warn!(
                "{} consumers configured on {} CPUs; consumers will share cores",
                self.consumers,
                cpus
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = LoaderConfig::default();
        assert_eq!(cfg.consumers, 16);
        assert_eq!(cfg.ring_capacity, 1024);
        assert_eq!(cfg.separator_byte(), Ok(b','));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay_ms: 10,
            max_delay_ms: 50,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for(2), Duration::from_millis(20));
        assert_eq!(retry.delay_for(3), Duration::from_millis(40));
        assert_eq!(retry.delay_for(4), Duration::from_millis(50));
        assert_eq!(retry.delay_for(70), Duration::from_millis(50));
    }
}
