//! The orchestrator: one reader thread, N consumer threads, one ring between them.
//!
//! [`Loader::run`] validates the configuration, prepares the sink statement, opens
//! the input, checks that the input's width matches the statement, then starts the
//! threads and waits for all of them. The result is a [`LoadReport`] on success, or
//! a [`LoadAborted`] carrying the terminal error together with whatever the run got
//! done before it stopped.
//!
//! Any failure on any thread requests shutdown, so no thread is left waiting on a
//! peer that is gone.
//!
//! ```no_run
//! use ringload::config::LoaderConfig;
//! use ringload::loader::Loader;
//! use ringload::testing::MemorySink;
//! use std::sync::Arc;
//!
//! let sink = Arc::new(MemorySink::new(&["int", "double"]));
//! let config = LoaderConfig::default().with_consumers(4);
//! let report = Loader::new(config, "points.csv", "INSERT INTO points VALUES (?, ?)", sink)
//!     .run()?;
//! println!("{} rows in {:?}", report.records_written, report.elapsed);
//! # Ok::<(), ringload::loader::LoadAborted>(())
//! ```

use crate::config::{ConfigError, LoaderConfig, MalformedPolicy};
use crate::error::{LoadError, LoadResult};
#[cfg(feature = "metrics")]
use crate::metrics::{CounterMetric, GaugeMetric, HistogramMetric, MetricsCollector};
use crate::reader::{RecordSource, open_source};
use crate::ring::{Publisher, RingDispatcher, RingOptions};
use crate::schema::SchemaBinder;
use crate::shutdown::ShutdownSignal;
use crate::sink::{BatchSink, BatchWriter, WriterStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Statistics of a load, complete or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Records the reader published to the ring.
    pub records_read: u64,
    /// Rows the sink acknowledged.
    pub records_written: u64,
    pub batches: u64,
    pub retries: u64,
    /// Lines the reader rejected plus rows the consumers could not convert.
    pub skipped: u64,
    /// Rows dropped unflushed because the run was cancelled.
    pub abandoned: u64,
    /// Publishes that waited for a full ring.
    pub producer_stalls: u64,
    pub elapsed: Duration,
    /// One entry per consumer, in partition order.
    pub consumers: Vec<WriterStats>,
}

impl LoadReport {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records_written as f64 / secs
        } else {
            0.0
        }
    }

    /// Records each consumer received, indexed by partition.
    #[must_use]
    pub fn partition_counts(&self) -> Vec<u64> {
        self.consumers.iter().map(|c| c.records).collect()
    }

    fn absorb(&mut self, stats: WriterStats) {
        self.records_written += stats.written;
        self.batches += stats.batches;
        self.retries += stats.retries;
        self.skipped += stats.skipped;
        self.abandoned += stats.abandoned;
        self.consumers.push(stats);
    }

    /// The report as a metrics collector, ready to print or save.
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn metrics(&self) -> MetricsCollector {
        let mut m = MetricsCollector::new();
        m.register(Box::new(
            CounterMetric::with_value("records_read", self.records_read)
                .with_description("Records published by the reader"),
        ));
        m.register(Box::new(
            CounterMetric::with_value("records_written", self.records_written)
                .with_description("Rows acknowledged by the sink"),
        ));
        m.register(Box::new(CounterMetric::with_value("batches_flushed", self.batches)));
        m.register(Box::new(CounterMetric::with_value("sink_retries", self.retries)));
        m.register(Box::new(
            CounterMetric::with_value("rows_skipped", self.skipped)
                .with_description("Malformed rows skipped"),
        ));
        m.register(Box::new(CounterMetric::with_value("rows_abandoned", self.abandoned)));
        m.register(Box::new(CounterMetric::with_value(
            "producer_stalls",
            self.producer_stalls,
        )));
        m.register(Box::new(
            GaugeMetric::new("records_per_second", self.records_per_second())
                .with_description("Rows written per second of wall-clock time"),
        ));
        let latencies = self
            .consumers
            .iter()
            .flat_map(|c| c.flush_latencies_ms.iter().copied())
            .collect();
        m.register(Box::new(
            HistogramMetric::with_values("flush_latency_ms", latencies)
                .with_description("Sink write latency per batch, retries included"),
        ));
        for c in &self.consumers {
            m.set_counter(&format!("consumer_{}_records", c.consumer), c.records);
        }
        m.set_elapsed(self.elapsed);
        m
    }
}

/// A run that stopped on an error.
#[derive(Error, Debug)]
#[error("load aborted: {error}")]
pub struct LoadAborted {
    #[source]
    pub error: LoadError,
    pub report: LoadReport,
}

/// Loads one delimited file into one sink.
pub struct Loader {
    config: LoaderConfig,
    input: PathBuf,
    statement: String,
    sink: Arc<dyn BatchSink>,
    shutdown: ShutdownSignal,
}

struct ProducerOutcome {
    published: u64,
    skipped: u64,
    stalls: u64,
    result: LoadResult<()>,
}

type ConsumerOutcome = (WriterStats, LoadResult<u64>);

impl Loader {
    pub fn new(
        config: LoaderConfig,
        input: impl Into<PathBuf>,
        statement: impl Into<String>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self {
            config,
            input: input.into(),
            statement: statement.into(),
            sink,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle that cancels the run from another thread.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the load to completion.
    ///
    /// # Errors
    /// Returns [`LoadAborted`] with the first terminal error. Configuration problems
    /// are reported before any record is read.
    pub fn run(self) -> Result<LoadReport, LoadAborted> {
        let started = Instant::now();
        let outcome = self.execute();
        let (mut report, error) = match outcome {
            Ok((report, error)) => (report, error),
            Err(error) => (LoadReport::default(), Some(error)),
        };
        report.elapsed = started.elapsed();
        self.write_metrics(&report);

        match error {
            None => {
                log::info!(
                    "loaded {} records from {} in {:?} ({:.0} records/s, {} batches, {} retries, {} skipped)",
                    report.records_written,
                    self.input.display(),
                    report.elapsed,
                    report.records_per_second(),
                    report.batches,
                    report.retries,
                    report.skipped
                );
                Ok(report)
            }
            Some(error) => {
                log::error!("load of {} aborted: {error}", self.input.display());
                Err(LoadAborted { error, report })
            }
        }
    }

    /// Startup checks, then the threaded part. Startup failures return `Err`; failures
    /// while running come back next to the partial report.
    fn execute(&self) -> LoadResult<(LoadReport, Option<LoadError>)> {
        self.config.validate()?;
        let schema = self.sink.prepare(&self.statement).map_err(LoadError::Sink)?;
        let source = open_source(&self.config, &self.input)?;
        if source.arity() != schema.arity() {
            return Err(ConfigError::ArityMismatch {
                inferred: source.arity(),
                declared: schema.arity(),
            }
            .into());
        }
        let binder = SchemaBinder::new(schema)?;
        let ring = RingDispatcher::new(
            RingOptions::from_config(&self.config, source.arity()),
            self.shutdown.clone(),
        )?;
        log::info!(
            "starting load: {} consumers, ring capacity {}",
            self.config.consumers,
            self.config.ring_capacity
        );
        Ok(self.spawn_and_join(ring, source, &binder))
    }

    fn spawn_and_join(
        &self,
        ring: RingDispatcher,
        source: Box<dyn RecordSource>,
        binder: &SchemaBinder,
    ) -> (LoadReport, Option<LoadError>) {
        let (publisher, consumers) = ring.into_parts();
        let mut errors = Vec::new();

        let mut handles: Vec<(String, JoinHandle<ConsumerOutcome>)> = Vec::new();
        for consumer in consumers {
            let name = format!("loader-consumer-{}", consumer.index());
            let mut writer = BatchWriter::new(
                consumer.index(),
                Arc::clone(&self.sink),
                binder.clone(),
                &self.config,
                self.shutdown.clone(),
            );
            let shutdown = self.shutdown.clone();
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                let _guard = ShutdownOnPanic(shutdown.clone());
                let result = consumer.run(&mut writer);
                if let Err(e) = &result
                    && !matches!(e, LoadError::Cancelled)
                {
                    log::error!("consumer {} failed: {e}", writer.stats().consumer);
                    shutdown.request();
                }
                (writer.into_stats(), result)
            });
            match spawned {
                Ok(handle) => handles.push((name, handle)),
                Err(source) => {
                    self.shutdown.request();
                    errors.push(LoadError::Spawn { name, source });
                    break;
                }
            }
        }

        let mut report = LoadReport::default();
        if errors.is_empty() {
            let shutdown = self.shutdown.clone();
            let policy = self.config.malformed;
            let name = "loader-reader".to_string();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || produce(source, publisher, policy, &shutdown));
            match spawned {
                Ok(handle) => match handle.join() {
                    Ok(outcome) => {
                        report.records_read = outcome.published;
                        report.skipped += outcome.skipped;
                        report.producer_stalls = outcome.stalls;
                        if let Err(e) = outcome.result {
                            errors.push(e);
                        }
                    }
                    Err(_) => {
                        self.shutdown.request();
                        errors.push(LoadError::WorkerPanicked(name));
                    }
                },
                Err(source) => {
                    self.shutdown.request();
                    errors.push(LoadError::Spawn { name, source });
                }
            }
        } else {
            drop(publisher);
        }

        for (name, handle) in handles {
            match handle.join() {
                Ok((stats, result)) => {
                    report.absorb(stats);
                    if let Err(e) = result {
                        errors.push(e);
                    }
                }
                Err(_) => errors.push(LoadError::WorkerPanicked(name)),
            }
        }
        if report.abandoned > 0 {
            log::warn!("{} rows were read but never written", report.abandoned);
        }
        (report, terminal_error(errors))
    }

    #[cfg(feature = "metrics")]
    fn write_metrics(&self, report: &LoadReport) {
        if let Some(path) = &self.config.metrics_path
            && let Err(e) = report.metrics().save_to_file(path)
        {
            log::warn!("could not write metrics: {e:#}");
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn write_metrics(&self, _report: &LoadReport) {}
}

/// Read every record and publish it. Closes the ring on success; on failure requests
/// shutdown first so the consumers abandon instead of draining.
fn produce(
    mut source: Box<dyn RecordSource>,
    mut publisher: Publisher,
    policy: MalformedPolicy,
    shutdown: &ShutdownSignal,
) -> ProducerOutcome {
    let _guard = ShutdownOnPanic(shutdown.clone());
    let mut skipped = 0;
    let result = loop {
        if shutdown.is_requested() {
            break Err(LoadError::Cancelled);
        }
        match source.has_next() {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
        match publisher.publish_with(|record| source.next_into(record)) {
            Ok(_) => {}
            Err(LoadError::Exhausted) => break Ok(()),
            Err(e) if e.is_malformed() && policy == MalformedPolicy::SkipAndCount => {
                skipped += 1;
                log::warn!("skipping input line: {e}");
            }
            Err(e) => break Err(e),
        }
    };

    match &result {
        Ok(()) => log::info!(
            "reader done: {} records published over {} lines",
            publisher.published(),
            source.lines_read()
        ),
        Err(LoadError::Cancelled) => log::info!("reader stopped by shutdown request"),
        Err(e) => {
            log::error!("reader failed: {e}");
            shutdown.request();
        }
    }
    ProducerOutcome {
        published: publisher.published(),
        skipped,
        stalls: publisher.stalls(),
        result,
    }
}

/// The first error that is not a consequence of another thread's shutdown request.
fn terminal_error(errors: Vec<LoadError>) -> Option<LoadError> {
    let mut cancelled = None;
    for e in errors {
        if matches!(e, LoadError::Cancelled) {
            cancelled.get_or_insert(e);
        } else {
            return Some(e);
        }
    }
    cancelled
}

/// Requests shutdown if the owning thread unwinds.
struct ShutdownOnPanic(ShutdownSignal);

impl Drop for ShutdownOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_error_prefers_root_cause() {
        let errors = vec![
            LoadError::Cancelled,
            LoadError::RetriesExhausted {
                attempts: 3,
                last: crate::sink::SinkError::transient("timeout"),
            },
            LoadError::Cancelled,
        ];
        assert!(matches!(
            terminal_error(errors),
            Some(LoadError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(matches!(
            terminal_error(vec![LoadError::Cancelled]),
            Some(LoadError::Cancelled)
        ));
        assert!(terminal_error(Vec::new()).is_none());
    }

    #[test]
    fn throughput_of_empty_report_is_zero() {
        assert_eq!(LoadReport::default().records_per_second(), 0.0);
    }
}
