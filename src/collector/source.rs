use log::trace;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crate::error::{AgentError, Result};

/// Something that can report its current value when asked
///
/// Implemented per type; the poller only ever sees this capability.
pub trait Exposable: Send + Sync {
    /// Current reading, or `None` when there is nothing to report right now
    fn current_value(&self) -> Option<f64>;
}

impl Exposable for AtomicU64 {
    fn current_value(&self) -> Option<f64> {
        Some(self.load(Ordering::Relaxed) as f64)
    }
}

impl Exposable for AtomicI64 {
    fn current_value(&self) -> Option<f64> {
        Some(self.load(Ordering::Relaxed) as f64)
    }
}

impl Exposable for AtomicUsize {
    fn current_value(&self) -> Option<f64> {
        Some(self.load(Ordering::Relaxed) as f64)
    }
}

impl<E: Exposable + ?Sized> Exposable for Arc<E> {
    fn current_value(&self) -> Option<f64> {
        (**self).current_value()
    }
}

/// Host measurements a [`SampleProvider`] can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRequest {
    /// Seconds since boot
    Uptime,
    /// One minute load average
    LoadAverage1,
    /// Five minute load average
    LoadAverage5,
    /// Fifteen minute load average
    LoadAverage15,
}

impl SampleRequest {
    /// Metric name used when the reading is submitted
    pub fn metric_name(self) -> &'static str {
        match self {
            SampleRequest::Uptime => "uptime_seconds",
            SampleRequest::LoadAverage1 => "load_1m",
            SampleRequest::LoadAverage5 => "load_5m",
            SampleRequest::LoadAverage15 => "load_15m",
        }
    }
}

/// Turns a sample request into a numeric measurement
///
/// Providers are created once by the process bootstrap and handed to consumers by
/// reference.
pub trait SampleProvider: Send + Sync {
    fn sample(&self, request: SampleRequest) -> Result<f64>;
}

/// Reads host measurements from a procfs mount
pub struct HostSampleProvider {
    proc_root: PathBuf,
}

impl HostSampleProvider {
    /// Read from `/proc`
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from another procfs-shaped directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        fs::read_to_string(&path).map_err(|e| {
            AgentError::Sample(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    pub fn root(&self) -> &Path {
        &self.proc_root
    }
}

impl Default for HostSampleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleProvider for HostSampleProvider {
    fn sample(&self, request: SampleRequest) -> Result<f64> {
        let value = match request {
            SampleRequest::Uptime => parse_uptime(&self.read("uptime")?)?,
            SampleRequest::LoadAverage1 => parse_loadavg(&self.read("loadavg")?, 0)?,
            SampleRequest::LoadAverage5 => parse_loadavg(&self.read("loadavg")?, 1)?,
            SampleRequest::LoadAverage15 => parse_loadavg(&self.read("loadavg")?, 2)?,
        };
        trace!("Sampled {:?} = {}", request, value);
        Ok(value)
    }
}

// "43200.42 12345.67": the first field is seconds since boot
fn parse_uptime(text: &str) -> Result<f64> {
    text.split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| AgentError::Sample(format!("Unexpected uptime format: {}", text.trim())))
}

// "0.52 0.58 0.59 1/467 12345"
fn parse_loadavg(text: &str, field: usize) -> Result<f64> {
    text.split_whitespace()
        .nth(field)
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| AgentError::Sample(format!("Unexpected loadavg format: {}", text.trim())))
}
