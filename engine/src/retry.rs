//! Retry controller with capped exponential backoff.
//!
//! The controller runs attempts until one succeeds, the error is not
//! retryable, or the retry bound is reached. The ledger lives outside the
//! controller, so every attempt sees what earlier attempts transferred.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::shutdown::Shutdown;

/// Interval at which a backoff sleep checks for termination.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Delay before the retry following attempt `attempt` (zero based):
/// `min(max_interval, factor * base^attempt)` seconds.
pub fn backoff_interval(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = (config.factor * config.base.powi(exponent)).min(config.max_interval);
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Waits between attempts.
pub trait Sleeper {
    /// Sleep for `duration`, returning `Err(Terminated)` if termination is
    /// requested meanwhile.
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> Result<(), EngineError>;
}

/// Real sleeper that wakes up periodically to check the shutdown flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> Result<(), EngineError> {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.is_requested() {
                return Err(EngineError::Terminated);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// State of the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(u32),
    Retrying(u32),
    Succeeded,
    Failed,
}

/// Drives attempts according to a [`RetryConfig`].
pub struct RetryController<'a> {
    config: RetryConfig,
    sleeper: &'a dyn Sleeper,
    shutdown: Shutdown,
    state: RetryState,
}

impl<'a> RetryController<'a> {
    pub fn new(config: RetryConfig, sleeper: &'a dyn Sleeper, shutdown: Shutdown) -> Self {
        RetryController {
            config,
            sleeper,
            shutdown,
            state: RetryState::Attempting(0),
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Run `attempt` until it succeeds or the error escalates.
    ///
    /// `attempt` receives the zero-based attempt index. `on_retry` is told
    /// about every scheduled retry before the backoff sleep.
    pub fn run<T>(
        &mut self,
        mut attempt: impl FnMut(u32) -> Result<T, EngineError>,
        mut on_retry: impl FnMut(u32, Duration, &EngineError),
    ) -> Result<T, EngineError> {
        let mut index = 0;
        loop {
            self.state = RetryState::Attempting(index);
            match attempt(index) {
                Ok(value) => {
                    self.state = RetryState::Succeeded;
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && index < self.config.retries => {
                    let delay = backoff_interval(&self.config, index);
                    self.state = RetryState::Retrying(index);
                    warn!(
                        attempt = index + 1,
                        retries = self.config.retries,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "attempt failed, retrying"
                    );
                    on_retry(index, delay, &e);
                    if let Err(terminated) = self.sleeper.sleep(delay, &self.shutdown) {
                        self.state = RetryState::Failed;
                        return Err(terminated);
                    }
                    index += 1;
                }
                Err(e) => {
                    if e.is_retryable() && self.config.retries > 0 {
                        info!(retries = self.config.retries, "retries exhausted");
                    }
                    self.state = RetryState::Failed;
                    return Err(e);
                }
            }
        }
    }
}
