use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{GantryError, Result};

/// One retry policy shared by the fetch, clone, and queue-polling paths.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Multiply the delay by 2^attempt instead of keeping it fixed.
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            exponential: false,
        }
    }

    pub fn backoff(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            delay: initial,
            exponential: true,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.delay * 2u32.saturating_pow(attempt)
        } else {
            self.delay
        }
    }

    /// Run `f` until it succeeds, a non-retryable error surfaces, or the
    /// attempt budget is exhausted.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !is_retryable(&e) || attempt + 1 == self.max_attempts {
                        last_err = Some(e);
                        break;
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GantryError::Server(format!("{} failed", op))))
    }
}

fn is_retryable(e: &GantryError) -> bool {
    match e {
        GantryError::Http(_) | GantryError::Io(_) | GantryError::Stream(_) => true,
        GantryError::Server(_) => true,
        GantryError::Install { .. } => true,
        _ => false,
    }
}
