use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use super::{Capability, CapabilityError, CapabilityRequest, CapabilityResponse};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// `base * 2^(attempt-1) * jitter`, capped at `max_delay`. `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        let jittered = backoff.mul_f64(jitter.clamp(0.0, 2.0));
        jittered.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.5..1.5);
        self.delay_for_attempt(attempt, jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Spaces call starts at least `interval` apart across every caller sharing the bucket.
#[derive(Debug)]
pub struct LeakyBucket {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl LeakyBucket {
    pub fn per_second(rate: f64) -> Self {
        let interval = if rate.is_finite() && rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    pub max_in_flight: usize,
    pub max_calls_per_second: f64,
    pub retry: RetryPolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_calls_per_second: 4.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Wraps a capability with an in-flight cap, a start-rate cap and retry on transient errors.
/// One instance is shared by every concept of a run.
pub struct LimitedCapability<C> {
    inner: C,
    permits: Arc<Semaphore>,
    bucket: LeakyBucket,
    retry: RetryPolicy,
}

impl<C: Capability> LimitedCapability<C> {
    pub fn new(inner: C, config: LimiterConfig) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            bucket: LeakyBucket::per_second(config.max_calls_per_second),
            retry: config.retry,
        }
    }

    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    #[cfg(test)]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn attempt(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CapabilityError::Connection("admission semaphore closed".to_string()))?;
        self.bucket.acquire().await;
        self.inner.invoke(request).await
    }
}

#[async_trait]
impl<C: Capability> Capability for LimitedCapability<C> {
    async fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let mut attempt = 1;
        loop {
            match self.attempt(request).await {
                Ok(response) => {
                    debug!(stage = request.stage.as_str(), attempt, "capability call succeeded");
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.jittered_delay(attempt);
                    warn!(
                        stage = request.stage.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable capability failure"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(
                            stage = request.stage.as_str(),
                            attempts = attempt,
                            error = %err,
                            "capability retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
