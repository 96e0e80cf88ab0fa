//! In-memory sinks.

use crate::schema::{Schema, TypedBinding};
use crate::sink::{Batch, BatchSink, SinkError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One successful `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedBatch {
    /// Name of the thread that executed the batch.
    pub thread: String,
    pub rows: Vec<TypedBinding>,
}

/// Sink that stores every batch it is given.
#[derive(Debug)]
pub struct MemorySink {
    schema: Schema,
    delay: Option<Duration>,
    statements: Mutex<Vec<String>>,
    batches: Mutex<Vec<ExecutedBatch>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemorySink {
    /// A sink whose prepared statements bind columns of the given type tags.
    pub fn new<S: AsRef<str>>(tags: &[S]) -> Self {
        Self {
            schema: Schema::from_tags(tags),
            delay: None,
            statements: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `delay` in every `execute`, to simulate a slow store.
    #[must_use]
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    #[must_use]
    pub fn batches(&self) -> Vec<ExecutedBatch> {
        lock(&self.batches).clone()
    }

    /// Every stored row, in execution order.
    #[must_use]
    pub fn rows(&self) -> Vec<TypedBinding> {
        lock(&self.batches)
            .iter()
            .flat_map(|b| b.rows.iter().cloned())
            .collect()
    }
}

impl BatchSink for MemorySink {
    fn prepare(&self, statement: &str) -> Result<Schema, SinkError> {
        lock(&self.statements).push(statement.to_string());
        Ok(self.schema.clone())
    }

    fn execute(&self, batch: &Batch) -> Result<(), SinkError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();
        lock(&self.batches).push(ExecutedBatch {
            thread,
            rows: batch.rows().to_vec(),
        });
        Ok(())
    }
}

/// Sink that fails a scripted number of `execute` calls before succeeding.
#[derive(Debug)]
pub struct FlakySink {
    inner: MemorySink,
    failures: u32,
    fatal: bool,
    attempts: AtomicU32,
}

impl FlakySink {
    /// Fail the first `failures` calls with a transient error.
    #[must_use]
    pub fn transient(inner: MemorySink, failures: u32) -> Self {
        Self {
            inner,
            failures,
            fatal: false,
            attempts: AtomicU32::new(0),
        }
    }

    /// Never succeed; every call fails transiently.
    #[must_use]
    pub fn always_transient(inner: MemorySink) -> Self {
        Self::transient(inner, u32::MAX)
    }

    /// Fail every call with a fatal error.
    #[must_use]
    pub fn fatal(inner: MemorySink) -> Self {
        Self {
            fatal: true,
            ..Self::always_transient(inner)
        }
    }

    /// Number of `execute` calls so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inner(&self) -> &MemorySink {
        &self.inner
    }
}

impl BatchSink for FlakySink {
    fn prepare(&self, statement: &str) -> Result<Schema, SinkError> {
        self.inner.prepare(statement)
    }

    fn execute(&self, batch: &Batch) -> Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(SinkError::fatal("table does not exist"));
        }
        if attempt < self.failures {
            return Err(SinkError::transient(format!("write timeout (attempt {})", attempt + 1)));
        }
        self.inner.execute(batch)
    }
}
