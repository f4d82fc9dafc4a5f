use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::accumulator::{IntervalAccumulator, IntervalSnapshot, Sample};
use crate::metric::{MetricIdentity, MetricKind};

struct Inner<T: Sample> {
    index: HashMap<MetricIdentity, Arc<IntervalAccumulator<T>>>,
    // First-registration order, used when snapshotting
    order: Vec<Arc<IntervalAccumulator<T>>>,
}

/// Process-wide map from metric identity to its accumulator
pub struct AccumulatorRegistry<T: Sample = f64> {
    inner: RwLock<Inner<T>>,
    default_kind: MetricKind,
}

impl<T: Sample> AccumulatorRegistry<T> {
    /// Create a new empty registry whose metrics reset their extremes
    pub fn new() -> Self {
        Self::with_default_kind(MetricKind::Resetting)
    }

    /// Create a registry that creates accumulators of `kind` by default
    pub fn with_default_kind(kind: MetricKind) -> Self {
        Self {
            inner: RwLock::new(Inner {
                index: HashMap::new(),
                order: Vec::new(),
            }),
            default_kind: kind,
        }
    }

    /// Accumulator for `identity`, created with the default kind on first use
    pub fn get_or_create(&self, identity: &MetricIdentity) -> Arc<IntervalAccumulator<T>> {
        self.get_or_create_with_kind(identity, self.default_kind)
    }

    /// Accumulator for `identity`; `kind` only applies if this call creates it
    pub fn get_or_create_with_kind(
        &self,
        identity: &MetricIdentity,
        kind: MetricKind,
    ) -> Arc<IntervalAccumulator<T>> {
        if let Some(existing) = self.get(identity) {
            return existing;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        // Another producer may have registered it between the two locks
        if let Some(existing) = inner.index.get(identity) {
            return Arc::clone(existing);
        }

        let accumulator = Arc::new(IntervalAccumulator::new(identity.clone(), kind));
        inner.index.insert(identity.clone(), Arc::clone(&accumulator));
        inner.order.push(Arc::clone(&accumulator));
        debug!("Registered {:?} accumulator for {}", kind, identity);

        accumulator
    }

    /// Accumulator for `identity` if it has been registered
    pub fn get(&self, identity: &MetricIdentity) -> Option<Arc<IntervalAccumulator<T>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.index.get(identity).cloned()
    }

    /// Snapshot and reset every accumulator once, in registration order
    ///
    /// Accumulators that saw no samples this interval are reset but produce no
    /// snapshot.
    pub fn snapshot_all(&self, now: DateTime<Utc>) -> Vec<IntervalSnapshot<T>> {
        let accumulators: Vec<_> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.order.clone()
        };

        let snapshots: Vec<_> = accumulators
            .iter()
            .map(|acc| acc.snapshot_and_reset(now))
            .filter(|snap| snap.count > 0)
            .collect();

        trace!(
            "Snapshotted {} of {} accumulators",
            snapshots.len(),
            accumulators.len()
        );

        snapshots
    }

    /// Registered identities in registration order
    pub fn identities(&self) -> Vec<MetricIdentity> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.order.iter().map(|acc| acc.identity().clone()).collect()
    }

    /// Count the number of accumulators
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default implementation
impl<T: Sample> Default for AccumulatorRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
