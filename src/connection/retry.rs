//! Connect with retry and exponential backoff

use super::Connection;
use crate::error::RelayError;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration for establishing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Connect to `address`, retrying with exponential backoff.
pub async fn connect_with_retry(
    address: &str,
    max_frame_bytes: usize,
    policy: RetryPolicy,
) -> Result<Connection, RelayError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = policy.initial_delay;

    loop {
        tracing::debug!(
            address = %address,
            attempt = attempt,
            max_attempts = max_attempts,
            "attempting backend connection"
        );

        match Connection::connect(address, max_frame_bytes).await {
            Ok(connection) => {
                tracing::info!(address = %address, attempts = attempt, "backend connection established");
                return Ok(connection);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        address = %address,
                        attempts = attempt,
                        error = %e,
                        "failed to connect after max retries"
                    );
                    return Err(e);
                }

                tracing::warn!(
                    address = %address,
                    attempt = attempt,
                    next_delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "connection attempt failed, retrying"
                );

                sleep(delay).await;

                // Exponential backoff: double the delay, cap at max_delay
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
        }
    }
}
