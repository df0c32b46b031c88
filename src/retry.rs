//! Bounded retry with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Progress reported by [`RetryController`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// About to wait `delay` and then make retry number `attempt`.
    Attempt { attempt: u32, delay: Duration },
    /// Attempt `attempt` (0 is the first try) failed.
    Error { attempt: u32, message: String },
    /// Attempt `attempt` succeeded.
    Success { attempt: u32 },
}

pub trait RetryObserver: Send + Sync {
    fn on_event(&self, event: &RetryEvent);
}

/// Reports retry progress through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RetryObserver for LogObserver {
    fn on_event(&self, event: &RetryEvent) {
        match event {
            RetryEvent::Attempt { attempt, delay } => {
                log::info!("🔁 Reconnecting... attempt {} (delay: {:?})", attempt, delay)
            }
            RetryEvent::Error { attempt, message } => {
                log::warn!("❌ Connection attempt {} failed: {}", attempt, message)
            }
            RetryEvent::Success { attempt } if *attempt > 0 => {
                log::info!("✅ Successfully reconnected after {} retries", attempt)
            }
            RetryEvent::Success { .. } => {}
        }
    }
}

#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    observer: Arc<dyn RetryObserver>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_observer(policy, Arc::new(LogObserver))
    }

    pub fn with_observer(policy: RetryPolicy, observer: Arc<dyn RetryObserver>) -> Self {
        Self { policy, observer }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying every failure up to the policy bound.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but errors for which `retry_if`
    /// returns false are returned immediately.
    pub async fn execute_when<T, E, F, Fut, P>(&self, mut operation: F, retry_if: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    self.observer.on_event(&RetryEvent::Success { attempt });
                    return Ok(value);
                }
                Err(e) => {
                    self.observer.on_event(&RetryEvent::Error {
                        attempt,
                        message: e.to_string(),
                    });
                    if attempt >= self.policy.max_retries || !retry_if(&e) {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    self.observer
                        .on_event(&RetryEvent::Attempt { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
