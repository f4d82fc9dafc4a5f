use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::config::CollectorConfig;
use super::source::{Exposable, SampleProvider, SampleRequest};
use crate::metric::MetricIdentity;
use crate::recorder::SampleSink;

enum ProbeSource {
    Exposed(Arc<dyn Exposable>),
    Provided(Arc<dyn SampleProvider>, SampleRequest),
}

struct Probe {
    identity: MetricIdentity,
    source: ProbeSource,
}

/// Polls registered exposables and providers on a fixed interval
///
/// Each reading is submitted to the sink as one sample, so the usual flush
/// triggers apply to polled metrics too.
pub struct PeriodicCollector {
    config: CollectorConfig,
    sink: Arc<dyn SampleSink<f64>>,
    probes: Vec<Probe>,
    polls: AtomicU64,
    failures: AtomicU64,
}

impl PeriodicCollector {
    pub fn new(config: CollectorConfig, sink: Arc<dyn SampleSink<f64>>) -> Self {
        Self {
            config,
            sink,
            probes: Vec::new(),
            polls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Get the collector name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Poll `source` as the metric `name` in the collector's domain
    pub fn expose(&mut self, name: &str, source: Arc<dyn Exposable>) -> &mut Self {
        self.probes.push(Probe {
            identity: MetricIdentity::new(self.config.domain.as_str(), name),
            source: ProbeSource::Exposed(source),
        });
        self
    }

    /// Poll `provider` for `request`, named after the request
    pub fn provide(
        &mut self,
        provider: Arc<dyn SampleProvider>,
        request: SampleRequest,
    ) -> &mut Self {
        self.probes.push(Probe {
            identity: MetricIdentity::new(self.config.domain.as_str(), request.metric_name()),
            source: ProbeSource::Provided(provider, request),
        });
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Completed polling rounds
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Provider reads that failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Read every probe once; returns how many samples were submitted
    pub fn poll_once(&self) -> usize {
        let mut submitted = 0;
        for probe in &self.probes {
            let reading = match &probe.source {
                ProbeSource::Exposed(source) => source.current_value(),
                ProbeSource::Provided(provider, request) => match provider.sample(*request) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!("{}: failed to sample {}: {}", self.config.name, probe.identity, e);
                        None
                    }
                },
            };

            if let Some(value) = reading {
                self.sink.submit_as(&probe.identity, self.config.kind, value);
                submitted += 1;
            }
        }
        self.polls.fetch_add(1, Ordering::Relaxed);
        submitted
    }

    /// Poll until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting collector {} ({} probes every {:?})",
            self.config.name,
            self.probes.len(),
            self.config.interval
        );

        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let submitted = self.poll_once();
                    debug!("{}: submitted {} readings", self.config.name, submitted);
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Collector {} stopped after {} polls", self.config.name, self.polls());
    }
}
