use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Lifecycle of the collector connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Sending,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Sending => "sending",
        };
        f.write_str(name)
    }
}

/// Consecutive failures after which the connection is reported as down
pub const FAILURE_THRESHOLD: usize = 3;

/// Observable connection state plus failure bookkeeping
pub struct ConnectionStatus {
    /// Name of the connection
    name: String,

    state: watch::Sender<ConnectionState>,

    consecutive_failures: AtomicUsize,
}

impl ConnectionStatus {
    /// Create a new status, initially disconnected
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            state,
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection {}: {} -> {}", self.name, previous, next);
        }
    }

    /// Get the name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// A connect or send succeeded
    pub fn record_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if failures >= FAILURE_THRESHOLD {
            info!("Connection {} has recovered after {} failures", self.name, failures);
        }
    }

    /// A connect or send failed; drops the state to disconnected
    pub fn record_failure(&self, reason: &str) {
        self.set(ConnectionState::Disconnected);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        if failures == 1 {
            debug!("Connection {} failed: {}", self.name, reason);
        } else if failures == FAILURE_THRESHOLD {
            error!(
                "Connection {} is down after {} consecutive failures: {}",
                self.name, failures, reason
            );
        } else {
            warn!(
                "Connection {} failed ({} consecutive failures): {}",
                self.name, failures, reason
            );
        }
    }
}
