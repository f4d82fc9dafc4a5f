//! Process bootstrap that wires the engine together
//!
//! An [`Agent`] owns one registry, one trace buffer, the flush scheduler and the
//! transport. Producers get a [`Recorder`]; everything else runs on tasks that
//! stop when [`Agent::shutdown`] is called.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::Sample;
use crate::buffer::TraceBuffer;
use crate::collector::{CollectorConfig, PeriodicCollector};
use crate::config::EndpointConfig;
use crate::connection::{ConnectionState, Connector, SocketConnector};
use crate::discovery::{DiscoveryClient, DiscoveryState};
use crate::error::{AgentError, Result};
use crate::recorder::Recorder;
use crate::registry::AccumulatorRegistry;
use crate::retry::{RetryConfig, execute_with_retry};
use crate::scheduler::{FlushScheduler, FlushSignal};
use crate::transport::TransportClient;

/// What was left behind when an agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Snapshots the collector accepted over the agent's lifetime
    pub delivered: u64,
    /// Snapshots still buffered at exit, which are lost
    pub undelivered: usize,
    /// Snapshots dropped to buffer overflow
    pub overflowed: u64,
}

pub struct Agent<T: Sample = f64> {
    config: EndpointConfig,
    registry: Arc<AccumulatorRegistry<T>>,
    buffer: Arc<TraceBuffer<T>>,
    signal: Arc<FlushSignal>,
    scheduler: Arc<FlushScheduler<T>>,
    discovery: Arc<DiscoveryClient>,
    transport: Arc<TransportClient<T>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl<T: Sample> Agent<T> {
    /// Create an agent that talks to the collector over real sockets
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(SocketConnector))
    }

    /// Create an agent that opens collector channels through `connector`
    pub fn with_connector(config: EndpointConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(AccumulatorRegistry::new());
        let buffer = Arc::new(TraceBuffer::new(config.buffer_capacity()));
        let signal = Arc::new(FlushSignal::new(config.max_flush_size));
        let scheduler = Arc::new(FlushScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&buffer),
            Arc::clone(&signal),
            config.max_flush_time(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let discovery = Arc::new(DiscoveryClient::new(&config));
        let transport = Arc::new(TransportClient::new(
            &config,
            Arc::clone(&buffer),
            Arc::clone(&discovery),
            connector,
            shutdown_rx,
        ));

        debug!(
            "Agent created (flush every {:?} or {} samples, buffer capacity {})",
            config.max_flush_time(),
            config.max_flush_size,
            buffer.capacity()
        );

        Ok(Self {
            config,
            registry,
            buffer,
            signal,
            scheduler,
            discovery,
            transport,
            shutdown,
            tasks: Vec::new(),
            started: false,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// A cheap handle for submitting samples from any thread
    pub fn recorder(&self) -> Recorder<T> {
        Recorder::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.buffer),
            Arc::clone(&self.signal),
        )
    }

    pub fn registry(&self) -> &Arc<AccumulatorRegistry<T>> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<FlushScheduler<T>> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Arc<TransportClient<T>> {
        &self.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Snapshots waiting for delivery
    pub fn pending_snapshots(&self) -> usize {
        self.buffer.len()
    }

    /// Receiver that flips to `true` when the agent shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Connect to the collector before starting, retrying per `retry`
    pub async fn connect(&self, retry: RetryConfig) -> Result<()> {
        execute_with_retry(|| self.transport.connect(), retry, "Connecting to collector").await
    }

    /// Spawn the flush scheduler and the transport
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(AgentError::Other("Agent already started".to_string()));
        }
        self.started = true;

        let scheduler = Arc::clone(&self.scheduler);
        self.tasks
            .push(tokio::spawn(scheduler.run(self.shutdown.subscribe())));
        self.tasks
            .push(tokio::spawn(Arc::clone(&self.transport).run()));

        info!("Agent started");
        Ok(())
    }

    /// Signal every task, wait for them, then deliver what the open channel can take
    pub async fn shutdown(mut self) -> Result<ShutdownReport> {
        info!("Shutting down agent");
        self.shutdown.send_replace(true);

        for task in self.tasks.drain(..) {
            task.await
                .map_err(|e| AgentError::Other(format!("Agent task failed: {}", e)))?;
        }

        // Samples recorded after the scheduler stopped, or with no scheduler at all
        if self.scheduler.flush_now().is_err() {
            debug!("Final flush overflowed the trace buffer");
        }

        let drained = self.transport.drain_remaining().await;
        if drained > 0 {
            debug!("Delivered {} snapshots during shutdown", drained);
        }
        self.transport.disconnect().await;

        let report = ShutdownReport {
            delivered: self.transport.delivered(),
            undelivered: self.buffer.len(),
            overflowed: self.buffer.overflow_count(),
        };
        if report.undelivered > 0 {
            warn!(
                "{} snapshots were never delivered and are lost",
                report.undelivered
            );
        }
        info!(
            "Agent stopped: {} snapshots delivered, {} lost, {} dropped to overflow",
            report.delivered, report.undelivered, report.overflowed
        );
        Ok(report)
    }
}

impl Agent<f64> {
    /// A periodic collector that submits into this agent
    pub fn collector(&self, config: CollectorConfig) -> PeriodicCollector {
        PeriodicCollector::new(config, Arc::new(self.recorder()))
    }

    /// Run `collector` until the agent shuts down
    pub fn spawn_collector(&mut self, collector: PeriodicCollector) {
        let collector = Arc::new(collector);
        self.tasks
            .push(tokio::spawn(collector.run(self.shutdown.subscribe())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorConfigBuilder;
    use crate::connection::testing::{MockCollector, MockConnector};
    use crate::metric::MetricIdentity;
    use crate::recorder::SampleSink;
    use crate::retry::RetryBuilder;
    use crate::transport::BatchEnvelope;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn config(max_flush_size: usize, max_flush_time_ms: u64) -> EndpointConfig {
        let mut config = EndpointConfig::default();
        config.max_flush_size = max_flush_size;
        config.max_flush_time_ms = max_flush_time_ms;
        config.discovery.enabled = false;
        config
    }

    fn agent(config: EndpointConfig, collector: &Arc<MockCollector>) -> Agent<f64> {
        Agent::with_connector(config, Arc::new(MockConnector(Arc::clone(collector)))).unwrap()
    }

    fn envelopes(collector: &MockCollector) -> Vec<BatchEnvelope<f64>> {
        collector
            .received()
            .iter()
            .map(|bytes| BatchEnvelope::decode(bytes).unwrap())
            .collect()
    }

    async fn wait_for_delivery(agent: &Agent<f64>, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while agent.transport().delivered() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("snapshots were not delivered");
    }

    #[tokio::test]
    async fn test_size_flush_survives_outage_and_is_delivered_once() {
        let collector = MockCollector::new();
        collector.set_offline(true);

        let mut agent = agent(config(3, 100_000), &collector);
        agent.start().unwrap();

        let recorder = agent.recorder();
        let id = MetricIdentity::new("app", "latency");
        for sample in [10.0, 20.0, 5.0] {
            recorder.submit(&id, sample);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while agent.scheduler().flush_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("size trigger did not flush");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.received().is_empty());
        assert_eq!(agent.pending_snapshots(), 1);
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);

        collector.set_offline(false);
        wait_for_delivery(&agent, 1).await;

        let report = agent.shutdown().await.unwrap();
        assert_eq!(report.undelivered, 0);
        assert_eq!(report.delivered, 1);

        let delivered = envelopes(&collector);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].snapshots.len(), 1);

        let snapshot = &delivered[0].snapshots[0];
        assert_eq!(snapshot.identity, id);
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.min, 5.0);
        assert_eq!(snapshot.max, 20.0);
        assert!((snapshot.average - 35.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_reports_undelivered() {
        let collector = MockCollector::new();
        collector.set_offline(true);

        let mut agent = agent(config(100, 100_000), &collector);
        agent.start().unwrap();
        agent.recorder().submit(&MetricIdentity::new("app", "hits"), 1.0);

        let report = agent.shutdown().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.undelivered, 1);
    }

    #[tokio::test]
    async fn test_shutdown_delivers_final_flush_over_open_channel() {
        let collector = MockCollector::new();
        let mut agent = agent(config(100, 100_000), &collector);

        let retry = RetryBuilder::new().max_attempts(2).initial_delay(1).build();
        agent.connect(retry).await.unwrap();
        assert_eq!(agent.connection_state(), ConnectionState::Connected);

        agent.start().unwrap();
        agent.recorder().submit(&MetricIdentity::new("app", "hits"), 4.0);

        let report = agent.shutdown().await.unwrap();
        assert_eq!(report.undelivered, 0);
        assert_eq!(envelopes(&collector).len(), 1);
    }

    #[tokio::test]
    async fn test_connect_gives_up_when_collector_stays_down() {
        let collector = MockCollector::new();
        collector.set_offline(true);
        let agent = agent(config(10, 1000), &collector);

        let retry = RetryBuilder::new()
            .max_attempts(3)
            .initial_delay(1)
            .with_jitter(false)
            .build();
        let err = agent.connect(retry).await.unwrap_err();
        assert!(matches!(err, AgentError::Retry(_)));
    }

    #[tokio::test]
    async fn test_polled_readings_reach_the_collector() {
        let collector = MockCollector::new();
        let mut agent = agent(config(2, 100_000), &collector);
        agent.start().unwrap();

        let queue_depth = Arc::new(AtomicU64::new(12));
        let mut poller = agent.collector(
            CollectorConfigBuilder::new("queues")
                .domain("app")
                .interval(Duration::from_millis(10))
                .build(),
        );
        poller.expose("queue_depth", queue_depth.clone());
        agent.spawn_collector(poller);

        wait_for_delivery(&agent, 1).await;
        queue_depth.store(3, Ordering::Relaxed);

        let report = agent.shutdown().await.unwrap();
        assert!(report.delivered >= 1);
        let first = &envelopes(&collector)[0].snapshots[0];
        assert_eq!(first.identity, MetricIdentity::new("app", "queue_depth"));
        assert_eq!(first.max, 12.0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let collector = MockCollector::new();
        let mut agent = agent(config(10, 1000), &collector);
        agent.start().unwrap();
        assert!(agent.start().is_err());
        agent.shutdown().await.unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let collector = MockCollector::new();
        let result = Agent::<f64>::with_connector(
            config(0, 1000),
            Arc::new(MockConnector(collector)),
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
