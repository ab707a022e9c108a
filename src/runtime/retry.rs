// src/runtime/retry.rs
//! Retry-until-success-or-timeout primitive
//!
//! An attempt either succeeds, asks to be retried ([`Attempt::Retry`]), or
//! aborts ([`Attempt::Abort`]). Retries happen at a fixed interval until the
//! timeout elapses, at which point the last recoverable cause is returned
//! inside [`EngineError::RetryTimeout`].
//!
//! Waits are interruptible through an [`Interrupt`]. An interrupted wait
//! fails exactly like an exhausted timeout.

use crate::utils::errors::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Failure of a single attempt
#[derive(Debug)]
pub enum Attempt {
    /// Temporary condition, worth retrying later
    Retry(anyhow::Error),

    /// Anything else, returned to the caller immediately
    Abort(EngineError),
}

impl Attempt {
    pub fn retry(message: impl Into<String>) -> Self {
        Attempt::Retry(anyhow::anyhow!(message.into()))
    }
}

impl From<EngineError> for Attempt {
    fn from(err: EngineError) -> Self {
        Attempt::Abort(err)
    }
}

/// Sticky, shareable interruption signal for retry waits
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current and future waiter
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration`. Returns `false` if the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock();

        while !*triggered {
            if cvar.wait_until(&mut triggered, deadline).timed_out() {
                return !*triggered;
            }
        }

        false
    }
}

/// Fixed-interval retry runner
#[derive(Debug, Clone)]
pub struct RetryRunner {
    /// Initial delay before the first attempt
    delay: Duration,

    /// Delay between two attempts
    interval: Duration,

    /// No new attempt is made once this much time has elapsed
    timeout: Duration,

    interrupt: Option<Interrupt>,
}

impl RetryRunner {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            interval,
            timeout,
            interrupt: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Run `attempt` until it succeeds, aborts, or the timeout elapses.
    pub fn execute<T, F>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, Attempt>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        if !self.delay.is_zero() && !self.sleep(self.delay) {
            return Err(interrupted(attempts, None));
        }

        loop {
            attempts += 1;
            debug!("Execution attempt #{}", attempts);

            match attempt() {
                Ok(value) => {
                    debug!("Execution succeeded on attempt #{}", attempts);
                    return Ok(value);
                }
                Err(Attempt::Abort(err)) => {
                    debug!("Execution aborted on attempt #{}: {}", attempts, err);
                    return Err(err);
                }
                Err(Attempt::Retry(cause)) => {
                    if start.elapsed() >= self.timeout {
                        debug!("Execution failed on attempt #{}", attempts);
                        return Err(EngineError::RetryTimeout {
                            attempts,
                            cause: Some(cause),
                        });
                    }

                    if self.interval.is_zero() {
                        debug!("Execution attempt #{} failed, retrying without sleep", attempts);
                    } else {
                        debug!(
                            "Execution attempt #{} failed, retrying after sleep of {:?}",
                            attempts, self.interval
                        );
                        if !self.sleep(self.interval) {
                            return Err(interrupted(attempts, Some(cause)));
                        }
                    }
                }
            }
        }
    }

    fn sleep(&self, duration: Duration) -> bool {
        match &self.interrupt {
            Some(interrupt) => interrupt.sleep(duration),
            None => {
                std::thread::sleep(duration);
                true
            }
        }
    }
}

fn interrupted(attempts: u32, cause: Option<anyhow::Error>) -> EngineError {
    debug!("Execution interrupted after {} attempt(s)", attempts);
    EngineError::RetryTimeout {
        attempts,
        cause: cause.or_else(|| Some(anyhow::anyhow!("retry wait interrupted"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(interval_ms: u64, timeout_ms: u64) -> RetryRunner {
        RetryRunner::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn test_succeeds_first_time() {
        let mut calls = 0;
        let value = runner(10, 100)
            .execute(|| {
                calls += 1;
                Ok::<_, Attempt>(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retries_until_success() {
        let mut calls = 0;
        runner(5, 1_000)
            .execute(|| {
                calls += 1;
                if calls < 3 {
                    Err(Attempt::retry("not yet"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(calls, 3);
    }

    #[test]
    fn test_abort_is_not_retried() {
        let mut calls = 0;
        let err = runner(5, 1_000)
            .execute(|| -> std::result::Result<(), Attempt> {
                calls += 1;
                Err(EngineError::ProcessExited(Some(1)).into())
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, EngineError::ProcessExited(Some(1))));
    }

    #[test]
    fn test_timeout_wraps_last_cause() {
        let started = Instant::now();
        let mut calls = 0;
        let err = runner(20, 100)
            .execute(|| -> std::result::Result<(), Attempt> {
                calls += 1;
                Err(Attempt::retry(format!("refused #{}", calls)))
            })
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(100));
        match err {
            EngineError::RetryTimeout { attempts, cause } => {
                assert_eq!(attempts, calls);
                assert_eq!(cause.unwrap().to_string(), format!("refused #{}", calls));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_initial_delay() {
        let started = Instant::now();
        runner(0, 0)
            .with_delay(Duration::from_millis(50))
            .execute(|| Ok::<_, Attempt>(()))
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_interrupt_looks_like_timeout() {
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });

        let started = Instant::now();
        let err = runner(10_000, 60_000)
            .with_interrupt(interrupt)
            .execute(|| -> std::result::Result<(), Attempt> { Err(Attempt::retry("busy")) })
            .unwrap_err();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, EngineError::RetryTimeout { attempts: 1, .. }));
    }

    #[test]
    fn test_interrupt_is_sticky() {
        let interrupt = Interrupt::new();
        interrupt.trigger();

        assert!(interrupt.is_triggered());
        assert!(!interrupt.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn test_uninterrupted_sleep_completes() {
        let interrupt = Interrupt::new();
        assert!(interrupt.sleep(Duration::from_millis(10)));
    }
}
