//! Adaptive request pacing
//!
//! [`AutoRequestInterval`] spaces out repeated calls to an operation so that
//! requests arrive roughly as often as they have recently succeeded. The
//! interval between successes is smoothed exponentially and each call waits
//! until that interval has passed since the previous request.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use rlretry_rl::{Result, RlError};

/// Pacing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingConfig {
    /// Smoothing factor for the success interval, in (0, 1]
    pub alpha: f64,
    pub minimum: Duration,
    pub maximum: Option<Duration>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            minimum: Duration::ZERO,
            maximum: None,
        }
    }
}

impl PacingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(RlError::InvalidConfig(format!(
                "pacing alpha must be within (0, 1], got {}",
                self.alpha
            )));
        }
        if let Some(maximum) = self.maximum {
            if maximum < self.minimum {
                return Err(RlError::InvalidConfig(format!(
                    "pacing maximum {maximum:?} is below minimum {:?}",
                    self.minimum
                )));
            }
        }
        Ok(())
    }

    fn clamp(&self, interval: Duration) -> Duration {
        let interval = interval.max(self.minimum);
        match self.maximum {
            Some(maximum) => interval.min(maximum),
            None => interval,
        }
    }
}

#[derive(Debug, Default)]
struct PacingState {
    average: Duration,
    last_success: Option<Instant>,
    last_request: Option<Instant>,
}

type SuccessPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Paces calls to one operation
pub struct AutoRequestInterval<E> {
    config: PacingConfig,
    is_success: SuccessPredicate<E>,
    state: Mutex<PacingState>,
}

impl<E> AutoRequestInterval<E> {
    /// Pacer where every error counts as a failure
    pub fn new(config: PacingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            is_success: Box::new(|_| false),
            state: Mutex::new(PacingState::default()),
        })
    }

    /// Treat errors matching `predicate` as successes
    pub fn with_success_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_success = Box::new(predicate);
        self
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Current smoothed interval between successes
    pub async fn average_interval(&self) -> Duration {
        self.state.lock().await.average
    }

    /// Wait for the next slot, then run `operation`.
    ///
    /// Callers queue on the pacing state while waiting; the operation itself
    /// runs unlocked.
    pub async fn call<F, Fut, T>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let last_request = *state.last_request.get_or_insert(now);
            state.last_success.get_or_insert(now);

            let wait = state.average.saturating_sub(now - last_request);
            if !wait.is_zero() {
                trace!(wait_ms = wait.as_millis() as u64, "pacing request");
                sleep(wait).await;
            }
            state.last_request = Some(Instant::now());
        }

        let result = operation().await;
        let succeeded = match &result {
            Ok(_) => true,
            Err(error) => (self.is_success)(error),
        };

        if succeeded {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let last_success = state.last_success.unwrap_or(now);
            let interval = (now - last_success).as_nanos() as f64;
            let average = state.average.as_nanos() as f64;
            let smoothed = average + (interval - average) * self.config.alpha;
            state.average = self.config.clamp(Duration::from_nanos(smoothed.max(0.0).round() as u64));
            state.last_success = Some(now);
        }

        result
    }
}
