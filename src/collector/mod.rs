mod config;
mod periodic;
mod source;

// Re-export public items
pub use config::{CollectorConfig, CollectorConfigBuilder};
pub use periodic::PeriodicCollector;
pub use source::{Exposable, HostSampleProvider, SampleProvider, SampleRequest};
