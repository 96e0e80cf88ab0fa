//! Test doubles and fixtures for loads.
//!
//! - **Sinks**: [`MemorySink`] keeps every executed batch in memory together with the
//!   name of the thread that wrote it; [`FlakySink`] fails transiently (or fatally) on
//!   a script before delegating to a `MemorySink`.
//! - **Fixtures**: [`write_input`] / [`temp_input`] put input text on disk, and
//!   [`numeric_rows`] generates a K × M integer file with known contents.
//!
//! ```
//! use ringload::config::LoaderConfig;
//! use ringload::loader::Loader;
//! use ringload::testing::{MemorySink, temp_input};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let (_dir, path) = temp_input("1,2.5\n3,7.25\n")?;
//! let sink = Arc::new(MemorySink::new(&["integer", "double"]));
//! let config = LoaderConfig::default().with_consumers(1).with_ring_capacity(4);
//! let report = Loader::new(config, &path, "INSERT", sink.clone()).run()?;
//! assert_eq!(report.records_written, 2);
//! assert_eq!(sink.rows().len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod sinks;

pub use fixtures::*;
pub use sinks::*;
