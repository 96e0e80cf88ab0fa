//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure the pipeline can surface is a [`LoadError`]. Components return it
//! directly so the orchestrator can tell a retryable sink hiccup (already handled
//! inside the batch writer) from the conditions that must stop the run.

use crate::config::ConfigError;
use crate::schema::ColumnType;
use crate::sink::SinkError;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors raised while loading a file into a sink.
#[derive(Error, Debug)]
pub enum LoadError {
    /// `next` was called on a record source that has no more records.
    #[error("record source exhausted")]
    Exhausted,

    /// A line did not match the record shape or could not be decoded.
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },

    /// A record handed to the binder has the wrong number of fields.
    #[error("record has {found} fields, schema expects {expected}")]
    WrongWidth { expected: usize, found: usize },

    /// A field could not be parsed as its declared column type.
    #[error("malformed value {value:?} in column {column} (declared {declared})")]
    MalformedValue {
        column: usize,
        declared: ColumnType,
        value: String,
    },

    /// A declared column type has no registered converter.
    #[error("no converter for declared type {declared} (column {column})")]
    NoConverter { column: usize, declared: ColumnType },

    /// Opening, mapping or reading the input failed.
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The options or the inferred schema are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The sink refused a batch with a non-transient error.
    #[error("sink failure: {0}")]
    Sink(#[source] SinkError),

    /// The sink kept failing transiently past the retry bound.
    #[error("sink still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: SinkError,
    },

    /// A shutdown request stopped the run before the input was exhausted.
    #[error("load cancelled")]
    Cancelled,

    /// The operating system refused to start a pipeline thread.
    #[error("failed to spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A pipeline thread panicked.
    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),
}

impl LoadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from the input rather than the sink or the environment.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord { .. } | Self::WrongWidth { .. } | Self::MalformedValue { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_classification() {
        let rec = LoadError::MalformedRecord {
            line: 3,
            reason: "expected 2 fields, found 1".into(),
        };
        let val = LoadError::MalformedValue {
            column: 0,
            declared: ColumnType::Int,
            value: "abc".into(),
        };
        assert!(rec.is_malformed());
        assert!(val.is_malformed());
        assert!(!LoadError::Cancelled.is_malformed());
        assert_eq!(
            rec.to_string(),
            "malformed record at line 3: expected 2 fields, found 1"
        );
        assert_eq!(
            val.to_string(),
            "malformed value \"abc\" in column 0 (declared int)"
        );
    }

    #[test]
    fn retries_exhausted_keeps_last_cause() {
        let err = LoadError::RetriesExhausted {
            attempts: 4,
            last: SinkError::transient("write timeout"),
        };
        assert!(err.to_string().contains("4 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
