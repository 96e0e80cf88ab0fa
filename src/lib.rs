//! # ringload
//!
//! A **high-throughput loader** that streams very large delimited text files into a
//! batching sink. Reading, type conversion and writing run on separate threads
//! connected by a preallocated ring, so neither the tokenizer nor the sink's write
//! latency stalls the other.
//!
//! ## Pipeline
//!
//! ```text
//!  file ──► RecordSource ──► Publisher ══ ring ══► PartitionConsumer × N ──► BatchWriter ──► BatchSink
//!           (reader thread)                         (one thread per partition)
//! ```
//!
//! - [`reader`] tokenizes lines into fixed-width raw records, either from bounded
//!   memory-mapped windows ([`MappedReader`]) or from a buffered, optionally
//!   decompressing stream ([`BufferedReader`]).
//! - [`ring`] routes sequence `s` to consumer `s & (N - 1)`, blocks the reader when a
//!   slot is still in use, and marks the end of every burst so consumers know when to
//!   flush.
//! - [`schema`] converts raw text to typed values through an immutable converter table.
//! - [`sink`] batches bound rows per consumer and retries transient sink failures
//!   with exponential backoff.
//! - [`loader`] wires everything together and reports what happened.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ringload::{Loader, LoaderConfig};
//! use ringload::testing::MemorySink;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! ringload::logging::init_logger(log::LevelFilter::Info)?;
//!
//! let sink = Arc::new(MemorySink::new(&["integer", "text", "double"]));
//! let config = LoaderConfig::from_json_file("loader.json")?;
//! let report = Loader::new(config, "big.csv", "INSERT INTO t VALUES (?, ?, ?)", sink).run()?;
//! report.metrics().print();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `compression-gzip` / `compression-zstd`: decompression in the buffered reader.
//! - `metrics`: [`LoadReport::metrics`] and the `metrics_path` option.

pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod reader;
pub mod ring;
pub mod schema;
pub mod shutdown;
pub mod sink;
pub mod testing;

pub use config::{ConfigError, LoaderConfig, MalformedPolicy, ReaderKind, RetryConfig, WaitStrategy};
pub use error::{LoadError, LoadResult};
pub use loader::{LoadAborted, LoadReport, Loader};
pub use reader::{BufferedReader, MappedReader, RawRecord, RecordSource};
pub use ring::{PartitionConsumer, Publisher, RecordHandler, RingDispatcher, RingOptions};
pub use schema::{ColumnType, ConverterTable, Schema, SchemaBinder, TypedBinding, TypedValue};
pub use shutdown::ShutdownSignal;
pub use sink::{Batch, BatchSink, BatchWriter, SinkError};
