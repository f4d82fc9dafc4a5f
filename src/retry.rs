use log::{debug, warn};
use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AgentError, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: usize,

    /// Initial delay before first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_factor: f64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_factor: 1.5,
            max_delay_ms: 30_000, // 30 seconds
            jitter: true,
        }
    }
}

/// Exponential delay sequence shared by one retrying loop
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current_ms: u64,
    attempts: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_ms: config.initial_delay_ms,
            config,
            attempts: 0,
        }
    }

    /// Failures seen since the last reset
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Delay to wait before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let base = self.current_ms.min(self.config.max_delay_ms);
        let next = (self.current_ms as f64 * self.config.backoff_factor) as u64;
        self.current_ms = next.max(1).min(self.config.max_delay_ms);

        if self.config.jitter {
            Duration::from_millis(base + random::<u64>() % 100)
        } else {
            Duration::from_millis(base)
        }
    }

    /// Start over after a success
    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_delay_ms;
        self.attempts = 0;
    }
}

/// Execute a future with retry logic
pub async fn execute_with_retry<F, Fut, T, E>(
    operation: F,
    config: RetryConfig,
    context: &str,
) -> Result<T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let max_attempts = config.max_attempts;
    let mut backoff = Backoff::new(config);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let attempts = backoff.attempts() + 1;

                if attempts >= max_attempts {
                    return Err(AgentError::retry(context, attempts, err));
                }

                warn!("{} (attempt {}/{}): {}", context, attempts, max_attempts, err);

                let delay = backoff.next_delay();
                debug!("Retrying after {:?} delay", delay);
                sleep(delay).await;
            }
        }
    }
}

/// Builder for custom retry configurations
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay_ms: u64) -> Self {
        self.config.initial_delay_ms = delay_ms;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, delay_ms: u64) -> Self {
        self.config.max_delay_ms = delay_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
