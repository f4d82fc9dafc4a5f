use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::accumulator::{IntervalSnapshot, Sample};
use crate::error::{AgentError, Result};

/// Bounded, ordered holding area for snapshots awaiting transmission
///
/// When an append or requeue would exceed the capacity, the oldest snapshots are
/// dropped to make room, the overflow counter grows by exactly the number dropped,
/// and the caller gets [`AgentError::BufferOverflow`]. The entries that caused the
/// overflow are still kept.
pub struct TraceBuffer<T: Sample> {
    /// Pending snapshots, oldest first
    queue: Mutex<VecDeque<IntervalSnapshot<T>>>,

    /// Maximum number of pending snapshots
    capacity: usize,

    /// Snapshots dropped to overflow since creation
    overflow: AtomicU64,

    /// Wakes the drain side when something is appended
    ready: Notify,
}

impl<T: Sample> TraceBuffer<T> {
    /// Create a buffer holding at most `capacity` snapshots
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            overflow: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<IntervalSnapshot<T>>>> {
        self.queue
            .lock()
            .map_err(|_| AgentError::Other("Lock poisoned".to_string()))
    }

    // Drops from the front until the queue fits; returns how many went
    fn trim(&self, queue: &mut VecDeque<IntervalSnapshot<T>>) -> usize {
        let excess = queue.len().saturating_sub(self.capacity);
        if excess > 0 {
            queue.drain(..excess);
            self.overflow.fetch_add(excess as u64, Ordering::Relaxed);
        }
        excess
    }

    fn report(&self, dropped: usize) -> Result<()> {
        if dropped == 0 {
            return Ok(());
        }
        warn!(
            "Trace buffer full ({}), dropped {} oldest snapshots",
            self.capacity, dropped
        );
        Err(AgentError::BufferOverflow {
            dropped,
            capacity: self.capacity,
        })
    }

    /// Append snapshots in order, returning how many were appended
    pub fn append(&self, snapshots: Vec<IntervalSnapshot<T>>) -> Result<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let appended = snapshots.len();
        let dropped = {
            let mut queue = self.lock()?;
            queue.extend(snapshots);
            self.trim(&mut queue)
        };

        trace!("Appended {} snapshots to trace buffer", appended);
        self.ready.notify_one();

        self.report(dropped).map(|_| appended)
    }

    /// Remove and return up to `max` snapshots from the front
    pub fn drain(&self, max: usize) -> Result<Vec<IntervalSnapshot<T>>> {
        let mut queue = self.lock()?;
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    /// Put an unsent batch back at the front, keeping its order
    pub fn requeue_front(&self, batch: Vec<IntervalSnapshot<T>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let requeued = batch.len();
        let dropped = {
            let mut queue = self.lock()?;
            for snapshot in batch.into_iter().rev() {
                queue.push_front(snapshot);
            }
            self.trim(&mut queue)
        };

        debug!("Requeued {} unsent snapshots", requeued);
        self.report(dropped)
    }

    /// Wait until an append happens; returns at once if one was missed
    pub async fn wait_for_data(&self) {
        self.ready.notified().await;
    }

    /// Get the number of pending snapshots
    pub fn len(&self) -> usize {
        self.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total snapshots dropped to overflow
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
