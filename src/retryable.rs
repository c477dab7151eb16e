use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::pending;
use lazy_static::lazy_static;
use tokio::time::{sleep, Sleep};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{log_sink, Error, ErrorSink, ExitResult, FailureKind};
use crate::future::{waiter, ChanFuture, Waiter};
use crate::lifecycle::Lifecycle;
use crate::runner::{interruptible_run_fn, InterruptibleRunFn};
use crate::supervisor::child::background_child;
use crate::sync::lock;

lazy_static! {
    /// Time a `Retryable` waits before starting its child again.
    pub static ref DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
}

/// Name of the field under which the child keeps a weak handle to the
/// lifecycle of its `Retryable`.
pub const RETRYABLE_FIELD_NAME: &str = "$retryable";

#[derive(Clone, Copy, Debug, PartialEq)]
enum ChildState {
    Closed,
    Starting,
    Running,
}

struct RetryableInner<L> {
    name: String,
    child: L,
    lazy_start: AtomicBool,
    retry_interval: AtomicU64,
    sink: Mutex<ErrorSink>,
}

async fn wait_waiter(waiter: &mut Option<Waiter>) -> ExitResult {
    match waiter {
        Some(waiter) => waiter.await,
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

impl<L> RetryableInner<L>
where
    L: AsRef<Lifecycle> + Send + Sync + 'static,
{
    fn child(&self) -> &Lifecycle {
        self.child.as_ref()
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_nanos(self.retry_interval.load(Ordering::SeqCst))
    }

    fn report(&self, kind: FailureKind, err: &Error) {
        let sink = lock(&self.sink).clone();
        sink(kind, err)
    }

    fn retry_timer(&self) -> Option<Pin<Box<Sleep>>> {
        let interval = self.retry_interval();
        debug!(lifecycle = %self.name, child = %self.child().name(), ?interval, "child restart scheduled");
        Some(Box::pin(sleep(interval)))
    }

    /// Starts the child in the background. The returned waiter resolves with
    /// the outcome of the attempt, including a request the child rejected.
    fn start_child(&self) -> Waiter {
        let (future, receiver) = ChanFuture::channel();
        let future = Arc::new(future);
        self.child().add_started_future(future.clone());
        background_child(&self.name, self.child(), &future);
        waiter(receiver)
    }

    async fn start(self: Arc<Self>, interrupter: Context) -> Result<InterruptibleRunFn, Error> {
        let lazy_start = self.lazy_start.load(Ordering::SeqCst);
        if !lazy_start {
            let mut started = self.start_child();
            let mut interrupted = false;
            loop {
                tokio::select! {
                    result = &mut started => {
                        if let Err(err) = result {
                            self.report(FailureKind::Start, &err);
                            return Err(err);
                        }
                        break;
                    }
                    _ = interrupter.done(), if !interrupted => {
                        interrupted = true;
                        if let Err(err) = self.child().close() {
                            warn!(lifecycle = %self.name, error = %err, "child close failed");
                        }
                    }
                }
            }
        }

        let inner = self.clone();
        Ok(interruptible_run_fn(move |_lifecycle, interrupter| {
            inner.run(interrupter, lazy_start)
        }))
    }

    async fn run(self: Arc<Self>, interrupter: Context, lazy_start: bool) -> ExitResult {
        let child = self.child();
        let mut interrupted = false;
        let mut started: Option<Waiter> = None;
        let mut closed: Option<Waiter> = None;
        let mut timer: Option<Pin<Box<Sleep>>> = None;
        let mut state = if lazy_start {
            timer = Some(Box::pin(sleep(Duration::ZERO)));
            ChildState::Closed
        } else {
            closed = Some(child.closed_waiter());
            ChildState::Running
        };

        loop {
            tokio::select! {
                _ = wait_timer(&mut timer) => {
                    timer = None;
                    debug!(lifecycle = %self.name, child = %child.name(), "starting child");
                    started = Some(self.start_child());
                    state = ChildState::Starting;
                }
                result = wait_waiter(&mut started) => {
                    started = None;
                    match result {
                        Ok(()) => {
                            state = ChildState::Running;
                            closed = Some(child.closed_waiter());
                        }
                        Err(err) => {
                            state = ChildState::Closed;
                            self.report(FailureKind::Start, &err);
                            if interrupted {
                                return Ok(());
                            }
                            timer = self.retry_timer();
                        }
                    }
                }
                result = wait_waiter(&mut closed) => {
                    closed = None;
                    state = ChildState::Closed;
                    if let Err(err) = &result {
                        self.report(FailureKind::Exit, err);
                    }
                    if interrupted {
                        return Ok(());
                    }
                    timer = self.retry_timer();
                }
                _ = interrupter.done(), if !interrupted => {
                    interrupted = true;
                    if state == ChildState::Closed {
                        return Ok(());
                    }
                    if let Err(err) = child.close() {
                        warn!(lifecycle = %self.name, error = %err, "child close failed");
                    }
                }
            }
        }
    }
}

/// Keeps a child lifecycle alive: every start failure and every exit of the
/// child schedules a new start after the retry interval, until the
/// `Retryable` itself is closed.
///
/// By default the child is started eagerly, the `Retryable` start waits for
/// the first attempt and fails with its error. With `set_lazy_start(true)` the
/// first attempt happens in the run phase instead, so a failure of it is
/// retried like any other. Failures are reported to the error sink, which
/// logs them unless replaced.
///
/// A `Retryable` dereferences to its own `Lifecycle`; `get` returns the child.
///
/// Since: 0.0.0
pub struct Retryable<L> {
    lifecycle: Lifecycle,
    inner: Arc<RetryableInner<L>>,
}

impl<L> Retryable<L>
where
    L: AsRef<Lifecycle> + Send + Sync + 'static,
{
    /// Wraps `child` in a new `Retryable`.
    ///
    /// Since: 0.0.0
    pub fn new(child: L) -> Self {
        let name = format!("{}-retryable", child.as_ref().name());
        let inner = Arc::new(RetryableInner {
            name: name.clone(),
            child,
            lazy_start: AtomicBool::new(false),
            retry_interval: AtomicU64::new(DEFAULT_RETRY_INTERVAL.as_nanos() as u64),
            sink: Mutex::new(log_sink(name.clone())),
        });
        let supervisor = inner.clone();
        let lifecycle = Lifecycle::from_interruptible_starter_fn(
            name,
            Vec::new(),
            move |_lifecycle, interrupter| supervisor.clone().start(interrupter),
        );
        inner
            .child()
            .set_field(RETRYABLE_FIELD_NAME, lifecycle.downgrade());
        Self { lifecycle, inner }
    }

    /// Returns the wrapped child.
    pub fn get(&self) -> &L {
        &self.inner.child
    }

    /// Returns the lifecycle of this wrapper.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Defers the first start of the child to the run phase.
    pub fn set_lazy_start(&self, lazy_start: bool) -> &Self {
        self.inner.lazy_start.store(lazy_start, Ordering::SeqCst);
        self
    }

    /// Sets the delay between a failure of the child and its next start.
    pub fn set_retry_interval(&self, interval: Duration) -> &Self {
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.inner.retry_interval.store(nanos, Ordering::SeqCst);
        self
    }

    /// Replaces the sink that receives the start and exit failures of the
    /// child.
    pub fn set_error_sink<F>(&self, sink: F) -> &Self
    where
        F: Fn(FailureKind, &Error) + Send + Sync + 'static,
    {
        *lock(&self.inner.sink) = Arc::new(sink);
        self
    }

    pub fn lazy_start(&self) -> bool {
        self.inner.lazy_start.load(Ordering::SeqCst)
    }

    pub fn retry_interval(&self) -> Duration {
        self.inner.retry_interval()
    }
}

impl<L> Deref for Retryable<L> {
    type Target = Lifecycle;

    fn deref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl<L> AsRef<Lifecycle> for Retryable<L> {
    fn as_ref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl<L> Clone for Retryable<L> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<L> fmt::Debug for Retryable<L>
where
    L: AsRef<Lifecycle> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryable")
            .field("lifecycle", &self.lifecycle)
            .field("child", self.inner.child())
            .finish()
    }
}
