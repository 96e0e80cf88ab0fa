use anyhow::Result;
use ringload::config::{ConfigError, LoaderConfig, MalformedPolicy, ReaderKind, RetryConfig};
use ringload::error::LoadError;
use ringload::loader::{LoadAborted, Loader};
use ringload::schema::TypedValue;
use ringload::testing::{FlakySink, MemorySink, numeric_rows, temp_input};
use std::sync::Arc;
use std::time::Duration;

fn small_config() -> LoaderConfig {
    LoaderConfig::default()
        .with_consumers(4)
        .with_ring_capacity(8)
        .with_retry(RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        })
}

fn sorted_by_first(mut rows: Vec<Vec<TypedValue>>) -> Vec<Vec<TypedValue>> {
    rows.sort_by_key(|r| match r[0] {
        TypedValue::BigInt(v) => v,
        _ => i64::MIN,
    });
    rows
}

fn expected_rows(rows: usize, cols: usize) -> Vec<Vec<TypedValue>> {
    (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| TypedValue::BigInt((r * cols + c) as i64))
                .collect()
        })
        .collect()
}

#[test]
fn round_trip_through_every_reader() -> Result<()> {
    const K: usize = 500;
    const M: usize = 4;
    let (_dir, path) = temp_input(numeric_rows(K, M, ','))?;

    for reader in [ReaderKind::Mapped, ReaderKind::Buffered] {
        let sink = Arc::new(MemorySink::new(&["bigint"; M]));
        let config = small_config().with_reader(reader).with_max_window_bytes(64);
        let report = Loader::new(config, &path, "INSERT INTO t VALUES (?, ?, ?, ?)", sink.clone())
            .run()?;

        assert_eq!(report.records_read, K as u64, "{reader:?}");
        assert_eq!(report.records_written, K as u64);
        assert_eq!(report.partition_counts(), vec![125; 4]);
        assert_eq!(report.skipped + report.abandoned + report.retries, 0);
        assert!(report.batches >= 4);
        assert_eq!(sorted_by_first(sink.rows()), expected_rows(K, M));
        assert!(
            sink.batches()
                .iter()
                .all(|b| b.thread.starts_with("loader-consumer-"))
        );
        assert_eq!(
            sink.statements(),
            vec!["INSERT INTO t VALUES (?, ?, ?, ?)".to_string()]
        );
    }
    Ok(())
}

#[test]
fn malformed_value_fails_fast_by_default() -> Result<()> {
    let (_dir, path) = temp_input("1,2\n3,x\n5,6\n")?;
    let sink = Arc::new(MemorySink::new(&["int", "int"]));
    let config = small_config().with_consumers(1);
    let Err(LoadAborted { error, report }) = Loader::new(config, &path, "INSERT", sink).run() else {
        panic!("load should fail");
    };
    assert!(matches!(error, LoadError::MalformedValue { column: 1, .. }));
    assert_eq!(report.consumers.len(), 1);
    Ok(())
}

#[test]
fn malformed_line_fails_fast_at_the_reader() -> Result<()> {
    let (_dir, path) = temp_input("1,2\n3\n5,6\n")?;
    let sink = Arc::new(MemorySink::new(&["int", "int"]));
    let err = Loader::new(small_config(), &path, "INSERT", sink)
        .run()
        .unwrap_err();
    assert!(matches!(err.error, LoadError::MalformedRecord { line: 2, .. }));
    Ok(())
}

#[test]
fn skip_policy_counts_and_continues() -> Result<()> {
    let (_dir, path) = temp_input("1,2\n3,x\n4\n5,6\n7,8,9\n10,11\n")?;
    let sink = Arc::new(MemorySink::new(&["int", "int"]));
    let config = small_config().with_malformed_policy(MalformedPolicy::SkipAndCount);
    let report = Loader::new(config, &path, "INSERT", sink.clone()).run()?;
    assert_eq!(report.records_written, 3);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.records_read, 4);
    assert_eq!(sink.rows().len(), 3);
    Ok(())
}

#[test]
fn configuration_errors_stop_before_reading() -> Result<()> {
    let (_dir, path) = temp_input("1,2\n")?;
    let cases = [
        small_config().with_consumers(3),
        small_config().with_ring_capacity(12),
        small_config().with_consumers(8).with_ring_capacity(4),
        small_config().with_separator('é'),
    ];
    for config in cases {
        let sink = Arc::new(MemorySink::new(&["int", "int"]));
        let err = Loader::new(config, &path, "INSERT", sink.clone())
            .run()
            .unwrap_err();
        assert!(matches!(err.error, LoadError::Config(_)), "{err}");
        assert!(sink.statements().is_empty());
        assert_eq!(err.report.records_read, 0);
    }
    Ok(())
}

#[test]
fn statement_width_must_match_input() -> Result<()> {
    let (_dir, path) = temp_input("1,2,3\n")?;
    let sink = Arc::new(MemorySink::new(&["int", "int"]));
    let err = Loader::new(small_config(), &path, "INSERT", sink)
        .run()
        .unwrap_err();
    assert!(matches!(
        err.error,
        LoadError::Config(ConfigError::ArityMismatch {
            inferred: 3,
            declared: 2
        })
    ));
    Ok(())
}

#[test]
fn transient_sink_failures_are_retried() -> Result<()> {
    let (_dir, path) = temp_input(numeric_rows(10, 2, ','))?;
    let sink = Arc::new(FlakySink::transient(MemorySink::new(&["bigint", "bigint"]), 2));
    let config = small_config().with_consumers(1);
    let report = Loader::new(config, &path, "INSERT", sink.clone()).run()?;
    assert_eq!(report.retries, 2);
    assert_eq!(report.records_written, 10);
    assert_eq!(sink.inner().rows().len(), 10);
    Ok(())
}

#[test]
fn exhausted_retries_abort_the_load() -> Result<()> {
    let (_dir, path) = temp_input(numeric_rows(10, 2, ','))?;
    let sink = Arc::new(FlakySink::always_transient(MemorySink::new(&["bigint", "bigint"])));
    let err = Loader::new(small_config(), &path, "INSERT", sink)
        .run()
        .unwrap_err();
    assert!(matches!(
        err.error,
        LoadError::RetriesExhausted { attempts: 4, .. }
    ));
    assert_eq!(err.report.records_written, 0);
    Ok(())
}

#[test]
fn shutdown_request_cancels_the_load() -> Result<()> {
    let (_dir, path) = temp_input(numeric_rows(2_000, 2, ','))?;
    let sink = Arc::new(
        MemorySink::new(&["bigint", "bigint"]).with_execute_delay(Duration::from_millis(20)),
    );
    let config = small_config().with_consumers(1).with_max_batch_rows(1);
    let loader = Loader::new(config, &path, "INSERT", sink.clone());
    let signal = loader.shutdown_signal();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        signal.request();
    });

    let err = loader.run().unwrap_err();
    trigger.join().expect("trigger panicked");
    assert!(matches!(err.error, LoadError::Cancelled));
    assert!(err.report.records_written < 2_000);
    assert_eq!(sink.rows().len() as u64, err.report.records_written);
    Ok(())
}

#[cfg(feature = "metrics")]
#[test]
fn metrics_file_is_written() -> Result<()> {
    let (dir, path) = temp_input(numeric_rows(20, 2, ','))?;
    let metrics_path = dir.path().join("metrics.json");
    let sink = Arc::new(MemorySink::new(&["bigint", "bigint"]));
    let config = small_config().with_metrics_path(&metrics_path);
    let report = Loader::new(config, &path, "INSERT", sink).run()?;

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&metrics_path)?)?;
    assert_eq!(json["records_written"]["value"], 20);
    assert_eq!(json["flush_latency_ms"]["value"]["count"], report.batches);
    assert!(json["elapsed_ms"]["value"].is_u64());
    Ok(())
}
