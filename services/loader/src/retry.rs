use crate::config::Config;
use crate::error::WarehouseError;
use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff applied to transient storage failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            max_elapsed,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retry_initial_interval(),
            config.retry_max_interval(),
            config.retry_max_elapsed(),
        )
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the elapsed budget
    /// runs out. Only [`WarehouseError::is_transient`] errors are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, WarehouseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WarehouseError>>,
    {
        retry_notify(
            self.backoff(),
            || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |err: WarehouseError, delay: Duration| {
                metrics::counter!("ingest.copy.retries").increment(1);
                warn!(
                    operation = operation,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient storage failure, retrying"
                );
            },
        )
        .await
    }
}
