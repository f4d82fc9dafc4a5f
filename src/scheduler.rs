//! Drives snapshot+reset+enqueue across the registry
//!
//! A flush happens when either `max_flush_time` has passed since the previous
//! flush or `max_flush_size` samples have been submitted since then, whichever
//! comes first. Producers only touch an atomic counter; crossing the threshold
//! wakes the scheduler task through a [`Notify`].

use chrono::Utc;
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep_until};

use crate::accumulator::Sample;
use crate::buffer::TraceBuffer;
use crate::error::{AgentError, Result};
use crate::registry::AccumulatorRegistry;

/// Size trigger shared between producers and the scheduler
///
/// A producer applies its sample before recording it, so a flush can capture a
/// sample whose record has not landed yet. The count then dips below zero until
/// that record arrives, which keeps every sample counted toward exactly one
/// flush.
pub struct FlushSignal {
    pending: AtomicI64,
    threshold: usize,
    notify: Notify,
}

impl FlushSignal {
    pub fn new(threshold: usize) -> Self {
        Self {
            pending: AtomicI64::new(0),
            threshold: threshold.max(1),
            notify: Notify::new(),
        }
    }

    /// Count one submitted sample; wakes the scheduler when the threshold is reached
    pub fn record(&self) {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending == self.threshold as i64 {
            trace!("Size trigger reached ({} pending samples)", pending);
            self.notify.notify_one();
        }
    }

    /// Samples submitted since the last flush
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire).max(0) as usize
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Discount the samples a flush captured
    fn settle(&self, flushed: u64) {
        let flushed = i64::try_from(flushed).unwrap_or(i64::MAX);
        let remaining = self.pending.fetch_sub(flushed, Ordering::AcqRel) - flushed;
        if remaining >= self.threshold as i64 {
            trace!("Size trigger still reached after flush ({} pending)", remaining);
            self.notify.notify_one();
        }
    }

    async fn triggered(&self) {
        self.notify.notified().await;
    }
}

/// Which condition started a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Time,
    Size,
    Shutdown,
    Manual,
}

/// The single driver of interval resets
pub struct FlushScheduler<T: Sample> {
    registry: Arc<AccumulatorRegistry<T>>,
    buffer: Arc<TraceBuffer<T>>,
    signal: Arc<FlushSignal>,
    max_flush_time: Duration,
    // Serializes flushes; the scheduler is the only resetter
    flush_lock: Mutex<()>,
    flushes: AtomicU64,
}

impl<T: Sample> FlushScheduler<T> {
    pub fn new(
        registry: Arc<AccumulatorRegistry<T>>,
        buffer: Arc<TraceBuffer<T>>,
        signal: Arc<FlushSignal>,
        max_flush_time: Duration,
    ) -> Self {
        Self {
            registry,
            buffer,
            signal,
            max_flush_time,
            flush_lock: Mutex::new(()),
            flushes: AtomicU64::new(0),
        }
    }

    /// Number of flushes that enqueued at least one snapshot
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Snapshot every accumulator and append the results to the trace buffer
    ///
    /// Returns the number of snapshots enqueued. An overflow of the trace buffer
    /// is returned as [`AgentError::BufferOverflow`] after the snapshots have been
    /// enqueued.
    pub fn flush_now(&self) -> Result<usize> {
        self.flush(FlushTrigger::Manual)
    }

    fn flush(&self, trigger: FlushTrigger) -> Result<usize> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let snapshots = self.registry.snapshot_all(Utc::now());
        let samples: u64 = snapshots.iter().map(|s| s.count).sum();
        self.signal.settle(samples);
        if snapshots.is_empty() {
            trace!("{:?} flush found nothing to send", trigger);
            return Ok(0);
        }

        debug!(
            "{:?} flush: {} snapshots covering {} samples",
            trigger,
            snapshots.len(),
            samples
        );
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.buffer.append(snapshots)
    }

    fn flush_logged(&self, trigger: FlushTrigger) {
        match self.flush(trigger) {
            Ok(_) => {}
            // Already reported by the buffer
            Err(AgentError::BufferOverflow { .. }) => {}
            Err(e) => error!("Flush failed: {}", e),
        }
    }

    /// Run the time and size triggers until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting flush scheduler (max time {:?}, max size {})",
            self.max_flush_time,
            self.signal.threshold()
        );

        let mut deadline = Instant::now() + self.max_flush_time;

        loop {
            let trigger = tokio::select! {
                _ = sleep_until(deadline) => FlushTrigger::Time,
                _ = self.signal.triggered() => FlushTrigger::Size,
                _ = shutdown.changed() => FlushTrigger::Shutdown,
            };

            self.flush_logged(trigger);
            if trigger == FlushTrigger::Shutdown {
                break;
            }
            deadline = Instant::now() + self.max_flush_time;
        }

        info!("Flush scheduler stopped after {} flushes", self.flush_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricIdentity;

    struct Fixture {
        registry: Arc<AccumulatorRegistry<f64>>,
        buffer: Arc<TraceBuffer<f64>>,
        signal: Arc<FlushSignal>,
        scheduler: Arc<FlushScheduler<f64>>,
    }

    fn fixture(max_size: usize, max_time: Duration) -> Fixture {
        let registry = Arc::new(AccumulatorRegistry::new());
        let buffer = Arc::new(TraceBuffer::new(100));
        let signal = Arc::new(FlushSignal::new(max_size));
        let scheduler = Arc::new(FlushScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&buffer),
            Arc::clone(&signal),
            max_time,
        ));
        Fixture {
            registry,
            buffer,
            signal,
            scheduler,
        }
    }

    fn submit(f: &Fixture, id: &MetricIdentity, value: f64) {
        f.registry.get_or_create(id).apply(value);
        f.signal.record();
    }

    #[test]
    fn test_flush_now_on_empty_registry_is_noop() {
        let f = fixture(10, Duration::from_secs(60));
        assert_eq!(f.scheduler.flush_now().unwrap(), 0);
        assert!(f.buffer.is_empty());
        assert_eq!(f.scheduler.flush_count(), 0);
    }

    #[test]
    fn test_flush_now_resets_pending() {
        let f = fixture(10, Duration::from_secs(60));
        let id = MetricIdentity::new("s", "n");
        submit(&f, &id, 1.0);
        submit(&f, &id, 2.0);
        assert_eq!(f.signal.pending(), 2);

        assert_eq!(f.scheduler.flush_now().unwrap(), 1);
        assert_eq!(f.signal.pending(), 0);
        assert_eq!(f.buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_before_time() {
        let f = fixture(3, Duration::from_secs(100));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&f.scheduler).run(rx));

        let id = MetricIdentity::new("app", "latency");
        for v in [10.0, 20.0, 5.0] {
            submit(&f, &id, v);
        }

        tokio::time::timeout(Duration::from_secs(5), f.buffer.wait_for_data())
            .await
            .expect("size trigger did not flush");

        let batch = f.buffer.drain(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].count, 3);
        assert_eq!(batch[0].min, 5.0);
        assert_eq!(batch[0].max, 20.0);
        assert!((batch[0].average - 35.0 / 3.0).abs() < 1e-9);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_time_trigger_flushes_without_traffic_threshold() {
        let f = fixture(1000, Duration::from_millis(50));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&f.scheduler).run(rx));

        submit(&f, &MetricIdentity::new("app", "rare"), 1.0);

        tokio::time::timeout(Duration::from_secs(5), f.buffer.wait_for_data())
            .await
            .expect("time trigger did not flush");
        assert_eq!(f.buffer.len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_interval() {
        let f = fixture(1000, Duration::from_secs(100));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&f.scheduler).run(rx));

        submit(&f, &MetricIdentity::new("app", "tail"), 4.0);
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(f.buffer.len(), 1);
    }

    #[test]
    fn test_sample_recorded_after_flush_counts_toward_next() {
        let f = fixture(10, Duration::from_secs(60));
        let id = MetricIdentity::new("s", "n");
        submit(&f, &id, 1.0);
        // Applied but not yet recorded when the flush runs
        f.registry.get_or_create(&id).apply(2.0);

        assert_eq!(f.scheduler.flush_now().unwrap(), 1);
        assert_eq!(f.buffer.drain(10).unwrap()[0].count, 2);
        assert_eq!(f.signal.pending(), 0);

        f.signal.record();
        assert_eq!(f.signal.pending(), 0);
        submit(&f, &id, 3.0);
        assert_eq!(f.signal.pending(), 1);
    }

    #[tokio::test]
    async fn test_backlog_past_threshold_rearms_size_trigger() {
        let f = fixture(2, Duration::from_secs(60));
        let id = MetricIdentity::new("s", "n");
        submit(&f, &id, 1.0);
        submit(&f, &id, 2.0);
        tokio::time::timeout(Duration::from_millis(100), f.signal.triggered())
            .await
            .expect("threshold reached");

        // Recorded after the wake but before the next flush looks
        f.signal.record();
        f.signal.record();
        f.signal.record();
        f.signal.settle(2);
        assert_eq!(f.signal.pending(), 3);
        tokio::time::timeout(Duration::from_millis(100), f.signal.triggered())
            .await
            .expect("remaining backlog should trigger again");
    }
}
