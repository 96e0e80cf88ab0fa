//! Sink seam and the per-consumer batching adapter.
//!
//! [`BatchSink`] is what an external store implements: it prepares a statement (which
//! fixes the column types) and executes batches of bound rows. [`BatchWriter`] sits
//! on a consumer thread between the ring and the sink. It binds each raw record,
//! accumulates the bindings, and flushes when the ring says the burst is over.
//!
//! Transient sink failures are retried here, on the same batch, with exponential
//! backoff. Rows a retried batch already committed are not rolled back; the sink is
//! expected to tolerate replays.

use crate::config::{LoaderConfig, MalformedPolicy, RetryConfig};
use crate::error::{LoadError, LoadResult};
use crate::reader::RawRecord;
use crate::ring::RecordHandler;
use crate::schema::{Schema, SchemaBinder, TypedBinding};
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failure reported by a sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Worth retrying: timeouts, overload, lost connections.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A store that accepts batches of typed rows.
///
/// One sink is shared by every consumer thread, so `execute` is called concurrently.
pub trait BatchSink: Send + Sync {
    /// Prepare `statement` and report the column types it binds, in order.
    ///
    /// # Errors
    /// Any error aborts the load before input is read.
    fn prepare(&self, statement: &str) -> Result<Schema, SinkError>;

    /// Write every row of `batch`.
    ///
    /// # Errors
    /// [`SinkError::Transient`] makes the writer retry the same batch.
    fn execute(&self, batch: &Batch) -> Result<(), SinkError>;
}

/// Rows accumulated by one consumer since its last flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    rows: Vec<TypedBinding>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: TypedBinding) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn rows(&self) -> &[TypedBinding] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Counters of one [`BatchWriter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterStats {
    pub consumer: usize,
    /// Records received from the ring.
    pub records: u64,
    /// Rows the sink acknowledged.
    pub written: u64,
    pub batches: u64,
    pub retries: u64,
    /// Rows dropped under [`MalformedPolicy::SkipAndCount`].
    pub skipped: u64,
    /// Rows left unflushed by a cancelled run.
    pub abandoned: u64,
    pub flush_latencies_ms: Vec<f64>,
}

/// Per-consumer adapter from ring records to sink batches.
pub struct BatchWriter {
    sink: Arc<dyn BatchSink>,
    binder: SchemaBinder,
    retry: RetryConfig,
    policy: MalformedPolicy,
    max_batch_rows: Option<usize>,
    progress_interval: u64,
    shutdown: ShutdownSignal,
    batch: Batch,
    stats: WriterStats,
}

impl BatchWriter {
    pub fn new(
        consumer: usize,
        sink: Arc<dyn BatchSink>,
        binder: SchemaBinder,
        config: &LoaderConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            sink,
            binder,
            retry: config.retry,
            policy: config.malformed,
            max_batch_rows: config.max_batch_rows,
            progress_interval: config.progress_interval,
            shutdown,
            batch: Batch::new(),
            stats: WriterStats {
                consumer,
                ..WriterStats::default()
            },
        }
    }

    #[must_use]
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    #[must_use]
    pub fn into_stats(self) -> WriterStats {
        self.stats
    }

    /// Rows waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Convert `record` with this writer's binder.
    ///
    /// # Errors
    /// Returns a malformed-value or width error from the binder.
    pub fn bind(&self, record: &RawRecord) -> LoadResult<TypedBinding> {
        self.binder.bind(record)
    }

    pub fn add_to_batch(&mut self, binding: TypedBinding) {
        self.batch.push(binding);
    }

    /// Write the pending batch, retrying transient failures.
    ///
    /// An empty batch is not sent.
    ///
    /// # Errors
    /// [`LoadError::Sink`] for a fatal sink error, [`LoadError::RetriesExhausted`] once
    /// the retry bound is exceeded, [`LoadError::Cancelled`] if shutdown is requested
    /// while backing off.
    pub fn flush(&mut self) -> LoadResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let mut retries = 0u32;
        loop {
            match self.sink.execute(&self.batch) {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    if retries >= self.retry.max_retries {
                        return Err(LoadError::RetriesExhausted {
                            attempts: retries + 1,
                            last: e,
                        });
                    }
                    retries += 1;
                    self.stats.retries += 1;
                    let delay = self.retry.delay_for(retries);
                    log::debug!(
                        "consumer {}: {e}; retry {retries}/{} in {delay:?}",
                        self.stats.consumer,
                        self.retry.max_retries
                    );
                    self.back_off(delay)?;
                }
                Err(e) => return Err(LoadError::Sink(e)),
            }
        }

        let rows = self.batch.len();
        let elapsed = started.elapsed();
        self.stats.written += rows as u64;
        self.stats.batches += 1;
        self.stats.flush_latencies_ms.push(elapsed.as_secs_f64() * 1000.0);
        log::debug!(
            "consumer {} flushed {rows} rows in {elapsed:?}",
            self.stats.consumer
        );
        self.batch.clear();
        Ok(())
    }

    fn back_off(&self, delay: Duration) -> LoadResult<()> {
        const SLICE: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + delay;
        loop {
            if self.shutdown.is_requested() {
                return Err(LoadError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

impl RecordHandler for BatchWriter {
    fn on_record(&mut self, record: &RawRecord, sequence: u64, end_of_batch: bool) -> LoadResult<()> {
        self.stats.records += 1;
        if self.progress_interval > 0 && self.stats.records % self.progress_interval == 0 {
            log::info!(
                "consumer {} handled {} records (sequence {sequence})",
                self.stats.consumer,
                self.stats.records
            );
        }

        match self.bind(record) {
            Ok(binding) => self.add_to_batch(binding),
            Err(e) if e.is_malformed() && self.policy == MalformedPolicy::SkipAndCount => {
                self.stats.skipped += 1;
                log::warn!(
                    "consumer {} skipped sequence {sequence}: {e}",
                    self.stats.consumer
                );
            }
            Err(e) => return Err(e),
        }

        let full = self.max_batch_rows.is_some_and(|max| self.batch.len() >= max);
        if end_of_batch || full {
            self.flush()?;
        }
        Ok(())
    }

    fn on_drained(&mut self) -> LoadResult<()> {
        self.flush()
    }

    fn on_cancelled(&mut self) {
        let rows = self.batch.len();
        if rows > 0 {
            log::warn!(
                "consumer {} abandoned {rows} unflushed rows",
                self.stats.consumer
            );
        }
        self.stats.abandoned += rows as u64;
        self.batch.clear();
    }
}
