use std::sync::Arc;

use crate::accumulator::Sample;
use crate::buffer::TraceBuffer;
use crate::metric::{MetricIdentity, MetricKind};
use crate::registry::AccumulatorRegistry;
use crate::scheduler::FlushSignal;

/// What collaborators see of the engine: submit a sample, ask what is queued
pub trait SampleSink<T: Sample>: Send + Sync {
    /// Record one raw sample for `identity`
    fn submit(&self, identity: &MetricIdentity, sample: T);

    /// Record a sample, creating the metric as `kind` if it is new
    fn submit_as(&self, identity: &MetricIdentity, _kind: MetricKind, sample: T) {
        self.submit(identity, sample);
    }

    /// Snapshots flushed but not yet delivered
    fn pending_snapshots(&self) -> usize;
}

/// Hot-path entry point for producers
///
/// Submitting never blocks on the network or on the trace buffer; it locks only
/// the target accumulator and bumps the size-trigger counter.
pub struct Recorder<T: Sample> {
    registry: Arc<AccumulatorRegistry<T>>,
    buffer: Arc<TraceBuffer<T>>,
    signal: Arc<FlushSignal>,
}

impl<T: Sample> Recorder<T> {
    pub fn new(
        registry: Arc<AccumulatorRegistry<T>>,
        buffer: Arc<TraceBuffer<T>>,
        signal: Arc<FlushSignal>,
    ) -> Self {
        Self {
            registry,
            buffer,
            signal,
        }
    }

    /// Submit to a metric, creating it as `kind` if this is its first sample
    pub fn submit_with_kind(&self, identity: &MetricIdentity, kind: MetricKind, sample: T) {
        self.registry
            .get_or_create_with_kind(identity, kind)
            .apply(sample);
        self.signal.record();
    }

    /// Samples submitted since the last flush
    pub fn pending_samples(&self) -> usize {
        self.signal.pending()
    }

    /// Snapshots dropped because the trace buffer was full
    pub fn overflow_count(&self) -> u64 {
        self.buffer.overflow_count()
    }
}

impl<T: Sample> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            buffer: Arc::clone(&self.buffer),
            signal: Arc::clone(&self.signal),
        }
    }
}

impl<T: Sample> SampleSink<T> for Recorder<T> {
    fn submit(&self, identity: &MetricIdentity, sample: T) {
        self.registry.get_or_create(identity).apply(sample);
        self.signal.record();
    }

    fn submit_as(&self, identity: &MetricIdentity, kind: MetricKind, sample: T) {
        self.submit_with_kind(identity, kind, sample);
    }

    fn pending_snapshots(&self) -> usize {
        self.buffer.len()
    }
}
