use std::time::Duration;

use crate::metric::MetricKind;

/// Configuration for a periodic collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Name of the collector, used in logs
    pub name: String,
    /// Domain given to the identities of polled metrics
    pub domain: String,
    /// Time between polls
    pub interval: Duration,
    /// Kind given to polled metrics on first use
    pub kind: MetricKind,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            name: "default_collector".to_string(),
            domain: "host".to_string(),
            interval: Duration::from_secs(60),
            kind: MetricKind::Sticky,
        }
    }
}

/// Builder for collector configuration
pub struct CollectorConfigBuilder {
    config: CollectorConfig,
}

impl CollectorConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: CollectorConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    /// Set the polling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn kind(mut self, kind: MetricKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn build(self) -> CollectorConfig {
        self.config
    }
}
