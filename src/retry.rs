//! Runs a fallible operation until it succeeds, with a delay between
//! attempts and a cancellation signal that stops the waiting.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use lazy_static::lazy_static;
use tokio::time::sleep;
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, ExitResult};

lazy_static! {
    /// Delay used when the configured one is zero.
    pub static ref DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
}

/// What the policy closures of a `Retry` get to look at.
#[derive(Clone, Debug)]
pub struct RetryContext {
    /// The error returned by the last attempt.
    pub error: Error,
    /// How many retries happened before the last attempt.
    pub retry: usize,
}

type Operation = Box<dyn FnMut() -> BoxFuture<'static, ExitResult> + Send>;
type Policy<T> = Box<dyn Fn(&RetryContext) -> T + Send + Sync>;

/// A retry loop around a fallible operation.
///
/// An attempt that fails is retried after `interval` (or whatever `delay`
/// computes) unless the error is ignorable (which counts as success), not
/// retriable, or the retry budget is spent.
///
/// # Example
///
/// ```
/// # use lifecycle::prelude::*;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let result = Retry::new(|| async { Ok(()) })
///     .interval(Duration::from_millis(10))
///     .max_retry(3)
///     .run(&Context::new())
///     .await;
/// assert!(result.is_ok());
/// # }
/// ```
///
/// Since: 0.0.0
pub struct Retry {
    operation: Operation,
    interval: Duration,
    delay: Option<Policy<Duration>>,
    max_retry: Option<usize>,
    retriable: Option<Policy<bool>>,
    ignorable: Option<Policy<bool>>,
}

impl Retry {
    /// Creates a retry loop that retries forever, every `DEFAULT_RETRY_DELAY`.
    pub fn new<F, O>(mut operation: F) -> Self
    where
        F: FnMut() -> O + Send + 'static,
        O: Future<Output = ExitResult> + Send + 'static,
    {
        Self {
            operation: Box::new(move || operation().boxed()),
            interval: *DEFAULT_RETRY_DELAY,
            delay: None,
            max_retry: None,
            retriable: None,
            ignorable: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Computes the delay before every retry, overriding `interval`.
    pub fn delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&RetryContext) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Decides whether a failed attempt is retried at all.
    pub fn retriable<F>(mut self, retriable: F) -> Self
    where
        F: Fn(&RetryContext) -> bool + Send + Sync + 'static,
    {
        self.retriable = Some(Box::new(retriable));
        self
    }

    /// Decides whether an error is swallowed, ending the loop successfully.
    pub fn ignorable<F>(mut self, ignorable: F) -> Self
    where
        F: Fn(&RetryContext) -> bool + Send + Sync + 'static,
    {
        self.ignorable = Some(Box::new(ignorable));
        self
    }

    /// Returns the delay before the next attempt, or `None` when the loop
    /// must give up.
    fn next_delay(&self, ctx: &RetryContext) -> Option<Duration> {
        if let Some(max_retry) = self.max_retry {
            if ctx.retry >= max_retry {
                return None;
            }
        }
        if let Some(retriable) = &self.retriable {
            if !retriable(ctx) {
                return None;
            }
        }
        let delay = match &self.delay {
            Some(delay) => delay(ctx),
            None => self.interval,
        };
        if delay == Duration::ZERO {
            Some(*DEFAULT_RETRY_DELAY)
        } else {
            Some(delay)
        }
    }

    fn is_ignorable(&self, ctx: &RetryContext) -> bool {
        self.ignorable.as_ref().map_or(false, |ignorable| ignorable(ctx))
    }

    /// Runs the loop. Cancelling `ctx` while waiting for the next attempt
    /// ends the loop with an `InterruptedError`.
    pub async fn run(mut self, ctx: &Context) -> ExitResult {
        let mut retry = 0;
        loop {
            let error = match (self.operation)().await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            let retry_ctx = RetryContext { error, retry };
            if self.is_ignorable(&retry_ctx) {
                debug!(error = %retry_ctx.error, "ignoring error");
                return Ok(());
            }
            if retry_ctx.error.is_interrupted() {
                return Err(retry_ctx.error);
            }
            let delay = match self.next_delay(&retry_ctx) {
                Some(delay) => delay,
                None => return Err(retry_ctx.error),
            };
            retry += 1;
            debug!(error = %retry_ctx.error, retry, ?delay, "retrying");

            tokio::select! {
                _ = sleep(delay) => {}
                _ = ctx.done() => {
                    return Err(Error::interrupted(ctx.name(), "retry", Some(retry_ctx.error)));
                }
            }
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("interval", &self.interval)
            .field("max_retry", &self.max_retry)
            .finish()
    }
}
