use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::AppResult;

/// Bounded attempts with a fixed cooldown between them.
///
/// There is no fallback value: exhausting the budget yields
/// [`Attempted::Exhausted`] and the caller records a failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attempted<T> {
    Resolved { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            cooldown,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Runs `op` until it yields a value or the budget is spent.
    ///
    /// `Ok(None)` (no match) and transient errors consume an attempt. A rate
    /// limit error replaces the regular cooldown with the cooldown it carries,
    /// served even after the final attempt. Non-transient errors abort at once.
    pub async fn attempt<T, F, Fut>(&self, label: &str, mut op: F) -> AppResult<Attempted<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<Option<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            let pause = match op(attempt).await {
                Ok(Some(value)) => {
                    return Ok(Attempted::Resolved {
                        value,
                        attempts: attempt,
                    })
                }
                Ok(None) => {
                    debug!(label, attempt, "no match");
                    None
                }
                Err(err) if err.is_transient() => {
                    warn!(label, attempt, error = %err, "attempt failed");
                    err.rate_limit_cooldown()
                }
                Err(err) => return Err(err),
            };

            let last = attempt == self.max_attempts;
            match pause {
                Some(cooldown) => sleep(cooldown).await,
                None if !last => {
                    debug!(label, attempt, cooldown = ?self.cooldown, "waiting before retry");
                    sleep(self.cooldown).await
                }
                None => {}
            }
        }

        Ok(Attempted::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
