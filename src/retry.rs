//! Sensor-confirmed actuation with bounded retries.
//!
//! Mechanical actions such as gripping a vial cap are not reliable on the
//! first try. A [`ConfirmedAction`] performs one attempt and reports whether a
//! sensor confirmed the expected outcome; [`run_confirmed`] repeats it up to
//! the policy's limit, calling `recover` and waiting between attempts.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::RetryConfig;
use crate::error::{SdlError, SdlResult};

/// Defines a policy for retrying a confirmed action.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            settle_delay: config.settle_delay(),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// How a confirmed action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub confirmed: bool,
    pub attempts: u32,
}

impl Outcome {
    /// Turn an unconfirmed outcome into [`SdlError::DeviceConfirmation`].
    pub fn require(self, action: &str) -> SdlResult<u32> {
        if self.confirmed {
            Ok(self.attempts)
        } else {
            Err(SdlError::DeviceConfirmation {
                action: action.to_string(),
                attempts: self.attempts,
            })
        }
    }
}

/// One attempt at an action whose result a sensor can confirm.
#[async_trait]
pub trait ConfirmedAction: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Perform one attempt. `Ok(true)` means the expected state was observed;
    /// `Err` aborts without further attempts.
    async fn attempt(&mut self, attempt: u32) -> SdlResult<bool>;

    /// Return to the starting position before the next attempt.
    async fn recover(&mut self) -> SdlResult<()> {
        Ok(())
    }
}

/// Run `action` until confirmed or `policy.max_attempts` is reached.
pub async fn run_confirmed<A: ConfirmedAction + ?Sized>(
    action: &mut A,
    policy: &RetryPolicy,
) -> SdlResult<Outcome> {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if action.attempt(attempt).await? {
            if attempt > 1 {
                tracing::info!(action = action.name(), attempt, "Confirmed after retry");
            }
            return Ok(Outcome {
                confirmed: true,
                attempts: attempt,
            });
        }
        tracing::warn!(
            action = action.name(),
            attempt,
            max_attempts,
            "Not confirmed"
        );
        if attempt < max_attempts {
            action.recover().await?;
            sleep(policy.settle_delay).await;
        }
    }
    tracing::error!(action = action.name(), max_attempts, "Giving up");
    Ok(Outcome {
        confirmed: false,
        attempts: max_attempts,
    })
}
