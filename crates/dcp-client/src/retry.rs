//! Bounded, delayed retry wrapper.
//!
//! `Retry::any().delay(d).max(n).on_retry(h).run(op)` retries any failure of
//! `op` up to `n` times, sleeping `d` between attempts and invoking `h` with
//! `(attempt, cause, delay)` before each wait. A stop signal attached via
//! `until_stopped` terminates the loop without further attempts.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

type RetryHook = Box<dyn Fn(u32, &dyn fmt::Display, Duration) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retries exhausted: {0}")]
    Exhausted(E),
    #[error("retry loop cancelled")]
    Cancelled,
}

pub struct Retry {
    delay: Duration,
    max_retries: u32,
    on_retry: Option<RetryHook>,
    stop: Option<watch::Receiver<bool>>,
}

impl Retry {
    /// Retry on any error.
    pub fn any() -> Retry {
        Retry {
            delay: Duration::from_secs(1),
            max_retries: 0,
            on_retry: None,
            stop: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of retries after the initial attempt.
    pub fn max(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn on_retry(
        mut self,
        hook: impl Fn(u32, &dyn fmt::Display, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Attach a stop flag; when it flips to `true` the loop terminates with
    /// [`RetryError::Cancelled`] instead of sleeping or retrying.
    pub fn until_stopped(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub async fn run<T, E, F, Fut>(mut self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.stopped() {
                return Err(RetryError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(RetryError::Exhausted(cause));
                    }
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &cause, self.delay);
                    }
                    if !self.wait().await {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for the configured delay; returns `false` when cancelled.
    async fn wait(&mut self) -> bool {
        match &mut self.stop {
            None => {
                sleep(self.delay).await;
                true
            }
            Some(rx) => {
                tokio::select! {
                    () = sleep(self.delay) => true,
                    changed = rx.changed() => match changed {
                        Ok(()) => !*rx.borrow(),
                        // Stop sender gone: the owner is shutting down.
                        Err(_) => false,
                    },
                }
            }
        }
    }
}
