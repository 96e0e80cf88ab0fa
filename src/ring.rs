//! Single-producer, multi-consumer ring of preallocated record slots.
//!
//! The ring holds `capacity` slots (a power of two). The producer claims sequence `s`
//! and fills slot `s & (capacity - 1)` in place; publishing makes `s` visible to the
//! consumers. Consumer `i` of `n` (a power of two) handles exactly the sequences with
//! `s & (n - 1) == i`, so routing needs no coordination between consumers: each one
//! derives ownership from the sequence number alone.
//!
//! Backpressure: before writing `s >= capacity` the producer waits until the consumer
//! owning `s - capacity` has released it. With `capacity >= n` both sequences belong
//! to the same partition, so the producer only ever watches one consumer's progress.
//!
//! A consumer marks the last record of its partition that is visible when it looks
//! at the ring as end-of-batch. Handlers use that to flush.
//!
//! Ownership of a slot's record moves producer → consumer at publish and back at
//! release. Only the sequence counters are atomic; the record itself is never locked.

use crate::config::{ConfigError, LoaderConfig, WaitStrategy};
use crate::error::{LoadError, LoadResult};
use crate::reader::RawRecord;
use crate::shutdown::ShutdownSignal;
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Index of the consumer that handles `sequence` when there are `consumers` of them.
#[must_use]
pub fn partition_of(sequence: u64, consumers: usize) -> usize {
    (sequence & (consumers as u64 - 1)) as usize
}

/// Sizes and wait strategies of a ring.
#[derive(Debug, Clone, Copy)]
pub struct RingOptions {
    pub capacity: usize,
    pub consumers: usize,
    /// Width of every record slot.
    pub arity: usize,
    pub producer_wait: WaitStrategy,
    pub consumer_wait: WaitStrategy,
}

impl RingOptions {
    #[must_use]
    pub fn from_config(config: &LoaderConfig, arity: usize) -> Self {
        Self {
            capacity: config.ring_capacity,
            consumers: config.consumers,
            arity,
            producer_wait: config.producer_wait,
            consumer_wait: config.consumer_wait,
        }
    }
}

struct Slot {
    sequence: AtomicU64,
    record: UnsafeCell<RawRecord>,
}

struct RingInner {
    slots: Box<[Slot]>,
    slot_mask: u64,
    capacity: u64,
    consumers: usize,
    /// Number of published sequences; `s` is visible iff `s < published`.
    published: CachePadded<AtomicU64>,
    closed: AtomicBool,
    /// Per consumer, the first sequence of its partition it has not released yet.
    released: Box<[CachePadded<AtomicU64>]>,
    shutdown: ShutdownSignal,
}

// SAFETY: a slot's record is written only by the single `Publisher`, and only after
// the consumer owning the slot's previous sequence has released it (Acquire on
// `released`, paired with the consumer's Release store). A consumer reads a slot only
// for a sequence below `published` (Acquire, paired with the producer's Release store
// after the write) and only its own partition's sequences. No slot is ever accessed
// mutably and shared at the same time.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

/// Builds a ring and hands out its producer and consumer ends.
pub struct RingDispatcher {
    inner: Arc<RingInner>,
    options: RingOptions,
}

impl RingDispatcher {
    /// Preallocate every slot.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] unless both `capacity` and `consumers` are powers of
    /// two and `capacity >= consumers`.
    pub fn new(options: RingOptions, shutdown: ShutdownSignal) -> Result<Self, ConfigError> {
        if !options.capacity.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                option: "ring_capacity",
                value: options.capacity,
            });
        }
        if !options.consumers.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                option: "consumers",
                value: options.consumers,
            });
        }
        if options.capacity < options.consumers {
            return Err(ConfigError::CapacityBelowConsumers {
                capacity: options.capacity,
                consumers: options.consumers,
            });
        }

        let slots = (0..options.capacity)
            .map(|_| Slot {
                sequence: AtomicU64::new(u64::MAX),
                record: UnsafeCell::new(vec![String::new(); options.arity]),
            })
            .collect();
        let released = (0..options.consumers)
            .map(|i| CachePadded::new(AtomicU64::new(i as u64)))
            .collect();
        let inner = RingInner {
            slots,
            slot_mask: options.capacity as u64 - 1,
            capacity: options.capacity as u64,
            consumers: options.consumers,
            published: CachePadded::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            released,
            shutdown,
        };
        Ok(Self {
            inner: Arc::new(inner),
            options,
        })
    }

    /// Split into the single publisher and one consumer per partition.
    #[must_use]
    pub fn into_parts(self) -> (Publisher, Vec<PartitionConsumer>) {
        let publisher = Publisher {
            inner: Arc::clone(&self.inner),
            next: 0,
            idle: Idle::new(self.options.producer_wait),
            stalls: 0,
        };
        let consumers = (0..self.options.consumers)
            .map(|index| PartitionConsumer {
                inner: Arc::clone(&self.inner),
                index,
                idle: Idle::new(self.options.consumer_wait),
            })
            .collect();
        (publisher, consumers)
    }
}

/// Producer end of the ring. Dropping it closes the ring.
pub struct Publisher {
    inner: Arc<RingInner>,
    next: u64,
    idle: Idle,
    stalls: u64,
}

impl Publisher {
    /// Claim the next slot, let `fill` write the record in place, then publish it.
    ///
    /// Blocks while the slot still belongs to a consumer. If `fill` fails nothing is
    /// published and the same sequence is offered to the next call.
    ///
    /// # Errors
    /// Returns [`LoadError::Cancelled`] if shutdown is requested while waiting, or the
    /// error from `fill`.
    pub fn publish_with<F>(&mut self, fill: F) -> LoadResult<u64>
    where
        F: FnOnce(&mut RawRecord) -> LoadResult<()>,
    {
        let sequence = self.next;
        self.wait_for_slot(sequence)?;

        let slot = &self.inner.slots[(sequence & self.inner.slot_mask) as usize];
        // SAFETY: `wait_for_slot` established that no consumer holds this slot and only
        // this publisher writes slots.
        let record = unsafe { &mut *slot.record.get() };
        fill(record)?;
        slot.sequence.store(sequence, Ordering::Relaxed);
        self.inner.published.store(sequence + 1, Ordering::Release);
        self.next += 1;
        log::trace!("published sequence {sequence}");
        Ok(sequence)
    }

    /// Publish a copy of `record`.
    ///
    /// # Errors
    /// See [`Publisher::publish_with`].
    pub fn publish(&mut self, record: &RawRecord) -> LoadResult<u64> {
        self.publish_with(|slot| {
            slot.clone_from(record);
            Ok(())
        })
    }

    /// Number of records published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.next
    }

    /// How many publishes had to wait for a full ring.
    #[must_use]
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    /// Mark the end of input. Consumers drain what was published, then stop.
    pub fn close(self) {}

    fn wait_for_slot(&mut self, sequence: u64) -> LoadResult<()> {
        if sequence < self.inner.capacity {
            return Ok(());
        }
        let previous = sequence - self.inner.capacity;
        let owner = &self.inner.released[partition_of(sequence, self.inner.consumers)];
        if owner.load(Ordering::Acquire) > previous {
            return Ok(());
        }
        self.stalls += 1;
        self.idle.reset();
        loop {
            if self.inner.shutdown.is_requested() {
                return Err(LoadError::Cancelled);
            }
            self.idle.wait();
            if owner.load(Ordering::Acquire) > previous {
                return Ok(());
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Callbacks a consumer drives for the records of its partition.
pub trait RecordHandler {
    /// Handle one record. `end_of_batch` marks the last record of this partition that
    /// was available when the consumer looked at the ring.
    ///
    /// # Errors
    /// An error stops this consumer and is returned from [`PartitionConsumer::run`].
    fn on_record(&mut self, record: &RawRecord, sequence: u64, end_of_batch: bool) -> LoadResult<()>;

    /// The ring was closed and every record of the partition has been handled.
    ///
    /// # Errors
    /// An error is returned from [`PartitionConsumer::run`].
    fn on_drained(&mut self) -> LoadResult<()> {
        Ok(())
    }

    /// Shutdown was requested before the partition was drained.
    fn on_cancelled(&mut self) {}
}

/// Consumer end of the ring for one partition.
pub struct PartitionConsumer {
    inner: Arc<RingInner>,
    index: usize,
    idle: Idle,
}

impl PartitionConsumer {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Feed every record of this partition to `handler` until the ring is closed and
    /// drained. Returns the number of records handled.
    ///
    /// # Errors
    /// Returns the first handler error, or [`LoadError::Cancelled`] after calling
    /// [`RecordHandler::on_cancelled`] when shutdown is requested.
    pub fn run<H: RecordHandler>(mut self, handler: &mut H) -> LoadResult<u64> {
        let stride = self.inner.consumers as u64;
        let mut next = self.index as u64;
        let mut handled = 0u64;
        loop {
            let Some(available) = self.wait_for(next) else {
                if self.inner.shutdown.is_requested() {
                    handler.on_cancelled();
                    return Err(LoadError::Cancelled);
                }
                handler.on_drained()?;
                return Ok(handled);
            };
            while next < available {
                if self.inner.shutdown.is_requested() {
                    handler.on_cancelled();
                    return Err(LoadError::Cancelled);
                }
                let slot = &self.inner.slots[(next & self.inner.slot_mask) as usize];
                debug_assert_eq!(slot.sequence.load(Ordering::Relaxed), next);
                // SAFETY: `next < published` and `next` belongs to this partition, so the
                // producer finished writing the slot and will not touch it until we
                // release `next` below.
                let record = unsafe { &*slot.record.get() };
                let end_of_batch = next + stride >= available;
                handler.on_record(record, next, end_of_batch)?;
                handled += 1;
                next += stride;
                self.inner.released[self.index].store(next, Ordering::Release);
            }
        }
    }

    /// Wait until `next` is published. `None` means closed and drained, or shutdown.
    fn wait_for(&mut self, next: u64) -> Option<u64> {
        self.idle.reset();
        loop {
            if self.inner.shutdown.is_requested() {
                return None;
            }
            let closed = self.inner.closed.load(Ordering::Acquire);
            let published = self.inner.published.load(Ordering::Acquire);
            if published > next {
                return Some(published);
            }
            if closed {
                return None;
            }
            self.idle.wait();
        }
    }
}

/// Executes a [`WaitStrategy`] one step at a time.
struct Idle {
    strategy: WaitStrategy,
    backoff: Backoff,
    step: u32,
}

impl Idle {
    fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            backoff: Backoff::new(),
            step: 0,
        }
    }

    fn reset(&mut self) {
        self.backoff.reset();
        self.step = 0;
    }

    fn wait(&mut self) {
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => self.backoff.snooze(),
            WaitStrategy::Phased {
                spin_tries,
                yield_tries,
                sleep_us,
            } => {
                if self.step < spin_tries {
                    self.backoff.spin();
                } else if self.step < spin_tries.saturating_add(yield_tries) {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(Duration::from_micros(sleep_us.max(1)));
                }
            }
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<(u64, bool)>);

    impl RecordHandler for Collect {
        fn on_record(&mut self, _: &RawRecord, sequence: u64, end_of_batch: bool) -> LoadResult<()> {
            self.0.push((sequence, end_of_batch));
            Ok(())
        }
    }

    fn options(capacity: usize, consumers: usize) -> RingOptions {
        RingOptions {
            capacity,
            consumers,
            arity: 1,
            producer_wait: WaitStrategy::Yielding,
            consumer_wait: WaitStrategy::Yielding,
        }
    }

    #[test]
    fn rejects_bad_sizes() {
        let s = ShutdownSignal::new();
        assert!(RingDispatcher::new(options(6, 2), s.clone()).is_err());
        assert!(RingDispatcher::new(options(8, 3), s.clone()).is_err());
        assert!(matches!(
            RingDispatcher::new(options(2, 4), s),
            Err(ConfigError::CapacityBelowConsumers { .. })
        ));
    }

    #[test]
    fn burst_marks_last_record_of_partition() -> LoadResult<()> {
        let ring = RingDispatcher::new(options(8, 2), ShutdownSignal::new())?;
        let (mut publisher, consumers) = ring.into_parts();
        for i in 0..5 {
            publisher.publish(&vec![i.to_string()])?;
        }
        publisher.close();

        let mut seen = Vec::new();
        for consumer in consumers {
            let mut h = Collect(Vec::new());
            consumer.run(&mut h)?;
            seen.push(h.0);
        }
        assert_eq!(seen[0], vec![(0, false), (2, false), (4, true)]);
        assert_eq!(seen[1], vec![(1, false), (3, true)]);
        Ok(())
    }
}
