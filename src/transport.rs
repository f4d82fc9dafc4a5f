//! Delivery of buffered snapshots to the collector
//!
//! The transport drains contiguous prefixes of the [`TraceBuffer`] and sends each
//! as one [`BatchEnvelope`]. Anything that goes wrong during a send puts the batch
//! back at the front of the buffer and drops the connection, so delivery is
//! at-least-once: a collector may see a batch twice if it received it but the
//! acknowledgement of the write was lost, and it can deduplicate on `batch_id`.

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::accumulator::{IntervalSnapshot, Sample};
use crate::buffer::TraceBuffer;
use crate::config::EndpointConfig;
use crate::connection::{BatchChannel, ConnectionState, ConnectionStatus, Connector};
use crate::discovery::{DiscoveryClient, Endpoint};
use crate::error::{AgentError, Result};
use crate::retry::{Backoff, RetryConfig};

/// What goes over the wire for one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Sample", deserialize = "T: Sample"))]
pub struct BatchEnvelope<T> {
    pub batch_id: Uuid,
    /// Host name of the sending agent
    pub agent: String,
    pub sent_at: DateTime<Utc>,
    /// Snapshots in buffer order
    pub snapshots: Vec<IntervalSnapshot<T>>,
}

impl<T: Sample> BatchEnvelope<T> {
    pub fn new(agent: impl Into<String>, snapshots: Vec<IntervalSnapshot<T>>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            agent: agent.into(),
            sent_at: Utc::now(),
            snapshots,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Owns the collector connection and drains the trace buffer into it
pub struct TransportClient<T: Sample> {
    buffer: Arc<TraceBuffer<T>>,
    discovery: Arc<DiscoveryClient>,
    connector: Arc<dyn Connector>,
    channel: tokio::sync::Mutex<Option<Box<dyn BatchChannel>>>,
    endpoint: Mutex<Option<Endpoint>>,
    status: ConnectionStatus,
    shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
    synch_op_timeout: Duration,
    max_batch: usize,
    retry: RetryConfig,
    agent: String,
    delivered: AtomicU64,
    batches: AtomicU64,
}

impl<T: Sample> TransportClient<T> {
    pub fn new(
        config: &EndpointConfig,
        buffer: Arc<TraceBuffer<T>>,
        discovery: Arc<DiscoveryClient>,
        connector: Arc<dyn Connector>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let agent = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            buffer,
            discovery,
            connector,
            channel: tokio::sync::Mutex::new(None),
            endpoint: Mutex::new(None),
            status: ConnectionStatus::new("collector"),
            shutdown,
            connect_timeout: config.connect_timeout(),
            synch_op_timeout: config.synch_op_timeout(),
            max_batch: config.max_flush_size,
            retry: RetryConfig {
                initial_delay_ms: 250,
                max_delay_ms: config.max_flush_time_ms.max(1000),
                ..RetryConfig::default()
            },
            agent,
            delivered: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    /// Override the reconnect backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    /// Connection state changes as they happen
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Snapshots the collector has accepted
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Batches the collector has accepted
    pub fn batches_sent(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Endpoint resolved by the last successful discovery, until a connect fails
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache_endpoint(&self, endpoint: Option<Endpoint>) {
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    async fn resolve(&self) -> Result<Endpoint> {
        if let Some(endpoint) = self.endpoint() {
            return Ok(endpoint);
        }
        let mut shutdown = self.shutdown.clone();
        let endpoint = self.discovery.discover(&mut shutdown).await?;
        self.cache_endpoint(Some(endpoint.clone()));
        Ok(endpoint)
    }

    /// Open a channel to the collector unless one is already open
    pub async fn connect(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }

        self.status.set(ConnectionState::Connecting);
        let endpoint = match self.resolve().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.status.record_failure(&e.to_string());
                return Err(e);
            }
        };

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            self.status.set(ConnectionState::Disconnected);
            return Err(AgentError::Shutdown);
        }

        let attempt = tokio::select! {
            result = timeout(self.connect_timeout, self.connector.connect(&endpoint)) => result,
            _ = shutdown.changed() => {
                self.status.set(ConnectionState::Disconnected);
                return Err(AgentError::Shutdown);
            }
        };

        let result = match attempt {
            Ok(Ok(opened)) => {
                info!("Connected to collector {} ({})", endpoint, opened.peer());
                *channel = Some(opened);
                self.status.set(ConnectionState::Connected);
                self.status.record_success();
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => AgentError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout: self.connect_timeout,
            },
        };

        self.status.record_failure(&result.to_string());
        // A discovered endpoint may have gone away; probe again next time
        self.cache_endpoint(None);
        Err(result)
    }

    /// Send one batch over the open channel
    ///
    /// On any failure the batch is returned to the front of the buffer and the
    /// connection is dropped.
    pub async fn send(&self, batch: Vec<IntervalSnapshot<T>>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut channel = self.channel.lock().await;
        let Some(open) = channel.as_mut() else {
            self.requeue(batch);
            return Err(AgentError::Connection("not connected".to_string()));
        };

        let envelope = BatchEnvelope::new(self.agent.as_str(), batch);
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.requeue(envelope.snapshots);
                return Err(e);
            }
        };

        self.status.set(ConnectionState::Sending);
        let count = envelope.snapshots.len();
        let failure = match timeout(self.synch_op_timeout, open.send(&payload)).await {
            Ok(Ok(())) => {
                self.status.set(ConnectionState::Connected);
                self.delivered.fetch_add(count as u64, Ordering::Relaxed);
                self.batches.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Delivered batch {} ({} snapshots, {} bytes)",
                    envelope.batch_id,
                    count,
                    payload.len()
                );
                return Ok(count);
            }
            Ok(Err(e)) => e,
            Err(_) => AgentError::SynchOpTimeout {
                operation: format!("send to {}", open.peer()),
                timeout: self.synch_op_timeout,
            },
        };

        *channel = None;
        self.status.record_failure(&failure.to_string());
        self.requeue(envelope.snapshots);
        Err(failure)
    }

    fn requeue(&self, batch: Vec<IntervalSnapshot<T>>) {
        let count = batch.len();
        match self.buffer.requeue_front(batch) {
            Ok(()) => debug!("Returned {} unsent snapshots to the buffer", count),
            // The buffer has already logged the drop
            Err(AgentError::BufferOverflow { .. }) => {}
            Err(e) => warn!("Lost {} unsent snapshots: {}", count, e),
        }
    }

    /// Connect if needed and deliver one batch from the buffer
    ///
    /// Returns the number of snapshots delivered; zero when the buffer was empty.
    pub async fn drain_once(&self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.connect().await?;

        let batch = self.buffer.drain(self.max_batch)?;
        self.send(batch).await
    }

    /// Deliver what the open channel can take without reconnecting
    pub async fn drain_remaining(&self) -> usize {
        let mut delivered = 0;
        while !self.buffer.is_empty() {
            if self.channel.lock().await.is_none() {
                break;
            }
            let batch = match self.buffer.drain(self.max_batch) {
                Ok(batch) => batch,
                Err(_) => break,
            };
            match self.send(batch).await {
                Ok(n) => delivered += n,
                Err(_) => break,
            }
        }
        delivered
    }

    /// Close the channel, if any
    pub async fn disconnect(&self) {
        if self.channel.lock().await.take().is_some() {
            debug!("Closed collector channel");
        }
        self.status.set(ConnectionState::Disconnected);
    }

    /// Drain the buffer until shutdown, backing off after failures
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.retry.clone());
        info!("Starting transport (batch size {})", self.max_batch);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain_once().await {
                Ok(0) => {
                    backoff.reset();
                    tokio::select! {
                        _ = self.buffer.wait_for_data() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(_) => backoff.reset(),
                Err(AgentError::Shutdown) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    let attempt = backoff.attempts();
                    if e.is_transient() {
                        debug!("Delivery attempt {} failed: {}; retry in {:?}", attempt, e, delay);
                    } else {
                        warn!("Delivery attempt {} failed: {}; retry in {:?}", attempt, e, delay);
                    }
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(
            "Transport stopped: {} snapshots delivered in {} batches, {} still buffered",
            self.delivered(),
            self.batches_sent(),
            self.buffer.len()
        );
    }
}
