//! Run metrics.
//!
//! A [`MetricsCollector`] is a named set of [`Metric`]s that serializes to JSON. The
//! loader builds one from a finished run's [`LoadReport`](crate::loader::LoadReport)
//! (counters per outcome, throughput gauge, flush latency histogram) and can write it
//! to `metrics_path`. Callers may register their own metrics next to the built-in
//! ones before printing or saving.
//!
//! ```
//! use ringload::metrics::{CounterMetric, MetricsCollector};
//!
//! let mut metrics = MetricsCollector::new();
//! metrics.register(Box::new(CounterMetric::with_value("rows_rejected_upstream", 3)));
//! metrics.increment_counter("rows_rejected_upstream", 2);
//! assert_eq!(metrics.snapshot()["rows_rejected_upstream"], 5);
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A named value that can be reported as JSON.
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Thread-safe set of metrics keyed by name.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    elapsed: Option<Duration>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric of the same name.
    pub fn register(&mut self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    /// Record the wall-clock duration of the run.
    pub fn set_elapsed(&self, elapsed: Duration) {
        self.lock().elapsed = Some(elapsed);
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock().elapsed
    }

    /// Add `value` to the counter `name`, creating it if needed.
    ///
    /// A non-counter metric of that name is replaced by a fresh counter.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        if let Some(counter) = inner
            .metrics
            .get_mut(name)
            .and_then(|m| m.as_any_mut().downcast_mut::<CounterMetric>())
        {
            counter.count += value;
            return;
        }
        inner
            .metrics
            .insert(name.to_string(), Box::new(CounterMetric::with_value(name, value)));
    }

    pub fn set_counter(&self, name: &str, value: u64) {
        self.lock()
            .metrics
            .insert(name.to_string(), Box::new(CounterMetric::with_value(name, value)));
    }

    /// All metrics as one JSON object, `{name: {value, description?}}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut out = serde_json::Map::new();
        for (name, metric) in &inner.metrics {
            let mut entry = serde_json::Map::new();
            entry.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                entry.insert("description".to_string(), json!(desc));
            }
            out.insert(name.clone(), Value::Object(entry));
        }
        if let Some(elapsed) = inner.elapsed {
            out.insert(
                "elapsed_ms".to_string(),
                json!({
                    "value": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "description": "Wall-clock duration of the load in milliseconds",
                }),
            );
        }
        Value::Object(out)
    }

    /// Print every metric to stdout, sorted by name.
    pub fn print(&self) {
        let inner = self.lock();
        println!("\n============ Load Metrics ============");
        if let Some(elapsed) = inner.elapsed {
            println!(
                "Elapsed: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("--------------------------------------");
        }
        let mut sorted: Vec<_> = inner.metrics.iter().collect();
        sorted.sort_by_key(|(name, _)| *name);
        for (name, metric) in sorted {
            match metric.description() {
                Some(desc) => println!("{name}: {} ({desc})", metric.value()),
                None => println!("{name}: {}", metric.value()),
            }
        }
        println!("======================================\n");
    }

    /// Write [`MetricsCollector::to_json`] to `path`, pretty-printed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Name → value of every registered metric.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }
}

/// Monotonic count.
pub struct CounterMetric {
    name: String,
    count: u64,
    description: Option<String>,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Point-in-time reading, e.g. throughput.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Distribution of observed values, reported as summary statistics.
pub struct HistogramMetric {
    name: String,
    values: Vec<f64>,
    description: Option<String>,
}

impl HistogramMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_values(name, Vec::new())
    }

    pub fn with_values(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn record(&mut self, value: f64) {
        self.values.push(value);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> HistogramStats {
        if self.values.is_empty() {
            return HistogramStats::default();
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        HistogramStats {
            count,
            sum,
            mean: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p50: sorted[count / 2],
            p95: sorted[(count * 95) / 100],
            p99: sorted[(count * 99) / 100],
        }
    }
}

impl Metric for HistogramMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        let s = self.stats();
        json!({
            "count": s.count,
            "sum": s.sum,
            "mean": s.mean,
            "min": s.min,
            "max": s.max,
            "p50": s.p50,
            "p95": s.p95,
            "p99": s.p99,
        })
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Summary of a [`HistogramMetric`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_stats() {
        let h = HistogramMetric::with_values("flush_ms", vec![4.0, 1.0, 3.0, 2.0]);
        let s = h.stats();
        assert_eq!(s.count, 4);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.p50, 3.0);
    }

    #[test]
    fn increment_replaces_non_counter() {
        let mut m = MetricsCollector::new();
        m.register(Box::new(GaugeMetric::new("x", 1.5)));
        m.increment_counter("x", 2);
        m.increment_counter("x", 3);
        assert_eq!(m.snapshot()["x"], json!(5));
    }
}
