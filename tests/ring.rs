use anyhow::Result;
use ringload::config::{LoaderConfig, WaitStrategy};
use ringload::error::{LoadError, LoadResult};
use ringload::reader::RawRecord;
use ringload::ring::{RecordHandler, RingDispatcher, RingOptions, partition_of};
use ringload::schema::{Schema, SchemaBinder, TypedValue};
use ringload::shutdown::ShutdownSignal;
use ringload::sink::BatchWriter;
use ringload::testing::MemorySink;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn options(capacity: usize, consumers: usize, arity: usize) -> RingOptions {
    RingOptions {
        capacity,
        consumers,
        arity,
        producer_wait: WaitStrategy::Yielding,
        consumer_wait: WaitStrategy::default(),
    }
}

/// Records every sequence it sees and checks the slot content against it.
#[derive(Default)]
struct Checker {
    seen: Vec<u64>,
    flushes: usize,
    delay: Option<Duration>,
}

impl RecordHandler for Checker {
    fn on_record(&mut self, record: &RawRecord, sequence: u64, end_of_batch: bool) -> LoadResult<()> {
        assert_eq!(record[0], sequence.to_string());
        assert_eq!(record[1], format!("payload-{sequence}"));
        if let Some(d) = self.delay {
            thread::sleep(d);
        }
        self.seen.push(sequence);
        if end_of_batch {
            self.flushes += 1;
        }
        Ok(())
    }
}

fn run_ring(capacity: usize, consumers: usize, records: u64, slow: Option<Duration>) -> Result<(Vec<Checker>, u64)> {
    let ring = RingDispatcher::new(options(capacity, consumers, 2), ShutdownSignal::new())?;
    let (mut publisher, parts) = ring.into_parts();
    let handles: Vec<_> = parts
        .into_iter()
        .map(|consumer| {
            thread::spawn(move || {
                let mut checker = Checker {
                    delay: if consumer.index() == 0 { slow } else { None },
                    ..Checker::default()
                };
                consumer.run(&mut checker).map(|_| checker)
            })
        })
        .collect();

    for s in 0..records {
        publisher.publish_with(|slot| {
            slot[0] = s.to_string();
            slot[1] = format!("payload-{s}");
            Ok(())
        })?;
    }
    let stalls = publisher.stalls();
    publisher.close();

    let mut checkers = Vec::new();
    for h in handles {
        checkers.push(h.join().expect("consumer panicked")?);
    }
    Ok((checkers, stalls))
}

#[test]
fn partitions_are_total_and_disjoint() -> Result<()> {
    const K: u64 = 2_000;
    for n in [1usize, 2, 4, 8] {
        let (checkers, _) = run_ring(16, n, K, None)?;
        let mut all = Vec::new();
        for (i, c) in checkers.iter().enumerate() {
            assert!(c.seen.iter().all(|&s| partition_of(s, n) == i));
            assert!(c.seen.windows(2).all(|w| w[0] < w[1]), "partition order");
            if !c.seen.is_empty() {
                assert!(c.flushes >= 1);
            }
            all.extend_from_slice(&c.seen);
        }
        all.sort_unstable();
        assert_eq!(all, (0..K).collect::<Vec<_>>(), "n = {n}");
        let total: usize = checkers.iter().map(|c| c.seen.len()).sum();
        assert_eq!(total as u64, K);
    }
    Ok(())
}

#[test]
fn slow_consumer_blocks_the_producer_without_overwrites() -> Result<()> {
    let (checkers, stalls) = run_ring(4, 2, 200, Some(Duration::from_micros(200)))?;
    assert!(stalls > 0, "a 4-slot ring must fill up");
    assert_eq!(checkers[0].seen.len() + checkers[1].seen.len(), 200);
    Ok(())
}

#[test]
fn shutdown_releases_a_blocked_producer() -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let ring = RingDispatcher::new(options(2, 1, 2), shutdown.clone())?;
    let (mut publisher, _consumers) = ring.into_parts();
    publisher.publish(&vec!["0".into(), "payload-0".into()])?;
    publisher.publish(&vec!["1".into(), "payload-1".into()])?;

    let trigger = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            shutdown.request();
        })
    };
    let third = publisher.publish(&vec!["2".into(), "payload-2".into()]);
    trigger.join().expect("trigger panicked");
    assert!(matches!(third, Err(LoadError::Cancelled)));
    assert_eq!(publisher.published(), 2);
    Ok(())
}

#[test]
fn shutdown_releases_an_idle_consumer() -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let ring = RingDispatcher::new(options(4, 1, 2), shutdown.clone())?;
    let (_publisher, mut consumers) = ring.into_parts();
    let consumer = consumers.remove(0);
    let handle = thread::spawn(move || consumer.run(&mut Checker::default()));
    thread::sleep(Duration::from_millis(20));
    shutdown.request();
    let result = handle.join().expect("consumer panicked");
    assert!(matches!(result, Err(LoadError::Cancelled)));
    Ok(())
}

fn scenario(consumers: usize) -> Result<Vec<Arc<MemorySink>>> {
    let ring = RingDispatcher::new(options(4, consumers, 2), ShutdownSignal::new())?;
    let (mut publisher, parts) = ring.into_parts();
    publisher.publish(&vec!["1".into(), "2.5".into()])?;
    publisher.publish(&vec!["3".into(), "7.25".into()])?;
    publisher.close();

    let config = LoaderConfig::default();
    let mut sinks = Vec::new();
    for consumer in parts {
        let sink = Arc::new(MemorySink::new(&["integer", "double"]));
        let binder = SchemaBinder::new(Schema::from_tags(&["integer", "double"]))?;
        let mut writer = BatchWriter::new(
            consumer.index(),
            sink.clone(),
            binder,
            &config,
            ShutdownSignal::new(),
        );
        consumer.run(&mut writer)?;
        sinks.push(sink);
    }
    Ok(sinks)
}

#[test]
fn single_consumer_flushes_both_rows_in_one_batch() -> Result<()> {
    let sinks = scenario(1)?;
    let batches = sinks[0].batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].rows,
        vec![
            vec![TypedValue::Int(1), TypedValue::Double(2.5)],
            vec![TypedValue::Int(3), TypedValue::Double(7.25)],
        ]
    );
    Ok(())
}

#[test]
fn two_consumers_each_flush_one_row() -> Result<()> {
    let sinks = scenario(2)?;
    assert_eq!(
        sinks[0].rows(),
        vec![vec![TypedValue::Int(1), TypedValue::Double(2.5)]]
    );
    assert_eq!(
        sinks[1].rows(),
        vec![vec![TypedValue::Int(3), TypedValue::Double(7.25)]]
    );
    assert_eq!(sinks[0].batches().len(), 1);
    assert_eq!(sinks[1].batches().len(), 1);
    Ok(())
}
