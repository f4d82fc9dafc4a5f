//! Interval metric aggregation with buffered delivery to a remote collector

pub mod accumulator;
pub mod agent;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod handles;
pub mod metric;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod transport;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::accumulator::{IntervalAccumulator, IntervalSnapshot, Sample};
    pub use crate::agent::{Agent, ShutdownReport};
    pub use crate::buffer::TraceBuffer;
    pub use crate::collector::{Exposable, PeriodicCollector, SampleProvider, SampleRequest};
    pub use crate::config::{ConfigBuilder, EndpointConfig, Protocol};
    pub use crate::connection::ConnectionState;
    pub use crate::discovery::{DiscoveryClient, Endpoint};
    pub use crate::error::{AgentError, Result};
    pub use crate::handles::{Handle, HandleArena};
    pub use crate::metric::{MetricIdentity, MetricKind};
    pub use crate::recorder::{Recorder, SampleSink};
    pub use crate::registry::AccumulatorRegistry;
    pub use crate::retry::{RetryConfig, execute_with_retry};
    pub use crate::transport::{BatchEnvelope, TransportClient};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
