use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::context::Context;
use crate::error::{Error, ExitResult};
use crate::lifecycle::Lifecycle;

/// The run function returned by a `Starter`; it is invoked once, for the run
/// phase that follows the start that produced it.
pub type RunFn = Box<dyn FnOnce(Lifecycle) -> BoxFuture<'static, ExitResult> + Send>;

/// The close function returned by a `Starter`. It must cause the matching
/// `RunFn` to return.
pub type CloseFn = Box<dyn Fn(&Lifecycle) -> ExitResult + Send + Sync>;

/// The run function returned by an `InterruptibleStarter`.
pub type InterruptibleRunFn =
    Box<dyn FnOnce(Lifecycle, Context) -> BoxFuture<'static, ExitResult> + Send>;

/// The pluggable strategy a `Lifecycle` delegates its work to.
///
/// `do_close` is invoked while the lifecycle holds its state lock, it must
/// only signal `do_run` to return (e.g. send on a channel) and must not call
/// back into the lifecycle.
///
/// Since: 0.0.0
pub trait Runner: Send + Sync + 'static {
    /// Executes the start phase. A failure here skips the run phase.
    fn do_start(self: Arc<Self>, _lifecycle: Lifecycle) -> BoxFuture<'static, ExitResult> {
        async { Ok(()) }.boxed()
    }

    /// Executes the component's main work, returns when the work is done or
    /// after `do_close` was invoked.
    fn do_run(self: Arc<Self>, lifecycle: Lifecycle) -> BoxFuture<'static, ExitResult>;

    /// Signals a running `do_run` to return.
    fn do_close(&self, lifecycle: &Lifecycle) -> ExitResult;
}

/// A `Runner` that receives the cancellation signal of the current cycle
/// instead of implementing a close function. A close request aborts the
/// given `Context`, so a slow start can observe it too.
///
/// Since: 0.0.0
pub trait InterruptibleRunner: Send + Sync + 'static {
    /// Executes the start phase; it should return early once `interrupter`
    /// is done.
    fn do_start(
        self: Arc<Self>,
        _lifecycle: Lifecycle,
        _interrupter: Context,
    ) -> BoxFuture<'static, ExitResult> {
        async { Ok(()) }.boxed()
    }

    /// Executes the component's main work until it is done or `interrupter`
    /// is done.
    fn do_run(self: Arc<Self>, lifecycle: Lifecycle, interrupter: Context)
        -> BoxFuture<'static, ExitResult>;
}

/// Chooses the run and close functions of a cycle from inside its start
/// phase, e.g. after a handshake revealed what the component must do.
///
/// Close requests that arrive while the start phase executes are delivered
/// to the returned close function as soon as the start succeeds.
///
/// Since: 0.0.0
pub trait Starter: Send + Sync + 'static {
    /// Executes the start phase and returns the functions for the run phase.
    fn do_start(self: Arc<Self>, lifecycle: Lifecycle)
        -> BoxFuture<'static, Result<(RunFn, CloseFn), Error>>;
}

/// The interruptible version of `Starter`.
///
/// Since: 0.0.0
pub trait InterruptibleStarter: Send + Sync + 'static {
    /// Executes the start phase and returns the run function of the cycle.
    fn do_start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> BoxFuture<'static, Result<InterruptibleRunFn, Error>>;
}

////////////////////////////////////////////////////////////////////////////////

/// Boxes a closure into a `RunFn`.
pub fn run_fn<F, O>(run: F) -> RunFn
where
    F: FnOnce(Lifecycle) -> O + Send + 'static,
    O: Future<Output = ExitResult> + Send + 'static,
{
    Box::new(move |lifecycle| run(lifecycle).boxed())
}

/// Boxes a closure into a `CloseFn`.
pub fn close_fn<F>(close: F) -> CloseFn
where
    F: Fn(&Lifecycle) -> ExitResult + Send + Sync + 'static,
{
    Box::new(close)
}

/// Boxes a closure into an `InterruptibleRunFn`.
pub fn interruptible_run_fn<F, O>(run: F) -> InterruptibleRunFn
where
    F: FnOnce(Lifecycle, Context) -> O + Send + 'static,
    O: Future<Output = ExitResult> + Send + 'static,
{
    Box::new(move |lifecycle, interrupter| run(lifecycle, interrupter).boxed())
}

type PhaseFn = Box<dyn Fn(Lifecycle) -> BoxFuture<'static, ExitResult> + Send + Sync>;
type InterruptiblePhaseFn =
    Box<dyn Fn(Lifecycle, Context) -> BoxFuture<'static, ExitResult> + Send + Sync>;

/// A `Runner` built from closures.
pub(crate) struct FnRunner {
    start: PhaseFn,
    run: PhaseFn,
    close: CloseFn,
}

impl FnRunner {
    pub(crate) fn new<S, SO, R, RO, C>(start: S, run: R, close: C) -> Self
    where
        S: Fn(Lifecycle) -> SO + Send + Sync + 'static,
        SO: Future<Output = ExitResult> + Send + 'static,
        R: Fn(Lifecycle) -> RO + Send + Sync + 'static,
        RO: Future<Output = ExitResult> + Send + 'static,
        C: Fn(&Lifecycle) -> ExitResult + Send + Sync + 'static,
    {
        Self {
            start: Box::new(move |lifecycle| start(lifecycle).boxed()),
            run: Box::new(move |lifecycle| run(lifecycle).boxed()),
            close: Box::new(close),
        }
    }
}

impl Runner for FnRunner {
    fn do_start(self: Arc<Self>, lifecycle: Lifecycle) -> BoxFuture<'static, ExitResult> {
        (self.start)(lifecycle)
    }

    fn do_run(self: Arc<Self>, lifecycle: Lifecycle) -> BoxFuture<'static, ExitResult> {
        (self.run)(lifecycle)
    }

    fn do_close(&self, lifecycle: &Lifecycle) -> ExitResult {
        (self.close)(lifecycle)
    }
}

/// An `InterruptibleRunner` built from closures.
pub(crate) struct FnInterruptibleRunner {
    start: InterruptiblePhaseFn,
    run: InterruptiblePhaseFn,
}

impl FnInterruptibleRunner {
    pub(crate) fn new<S, SO, R, RO>(start: S, run: R) -> Self
    where
        S: Fn(Lifecycle, Context) -> SO + Send + Sync + 'static,
        SO: Future<Output = ExitResult> + Send + 'static,
        R: Fn(Lifecycle, Context) -> RO + Send + Sync + 'static,
        RO: Future<Output = ExitResult> + Send + 'static,
    {
        Self {
            start: Box::new(move |lifecycle, interrupter| start(lifecycle, interrupter).boxed()),
            run: Box::new(move |lifecycle, interrupter| run(lifecycle, interrupter).boxed()),
        }
    }
}

impl InterruptibleRunner for FnInterruptibleRunner {
    fn do_start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> BoxFuture<'static, ExitResult> {
        (self.start)(lifecycle, interrupter)
    }

    fn do_run(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> BoxFuture<'static, ExitResult> {
        (self.run)(lifecycle, interrupter)
    }
}

/// A `Starter` built from a closure.
pub(crate) struct FnStarter(
    Box<dyn Fn(Lifecycle) -> BoxFuture<'static, Result<(RunFn, CloseFn), Error>> + Send + Sync>,
);

impl FnStarter {
    pub(crate) fn new<S, O>(start: S) -> Self
    where
        S: Fn(Lifecycle) -> O + Send + Sync + 'static,
        O: Future<Output = Result<(RunFn, CloseFn), Error>> + Send + 'static,
    {
        Self(Box::new(move |lifecycle| start(lifecycle).boxed()))
    }
}

impl Starter for FnStarter {
    fn do_start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
    ) -> BoxFuture<'static, Result<(RunFn, CloseFn), Error>> {
        (self.0)(lifecycle)
    }
}

/// An `InterruptibleStarter` built from a closure.
pub(crate) struct FnInterruptibleStarter(
    Box<
        dyn Fn(Lifecycle, Context) -> BoxFuture<'static, Result<InterruptibleRunFn, Error>>
            + Send
            + Sync,
    >,
);

impl FnInterruptibleStarter {
    pub(crate) fn new<S, O>(start: S) -> Self
    where
        S: Fn(Lifecycle, Context) -> O + Send + Sync + 'static,
        O: Future<Output = Result<InterruptibleRunFn, Error>> + Send + 'static,
    {
        Self(Box::new(move |lifecycle, interrupter| start(lifecycle, interrupter).boxed()))
    }
}

impl InterruptibleStarter for FnInterruptibleStarter {
    fn do_start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> BoxFuture<'static, Result<InterruptibleRunFn, Error>> {
        (self.0)(lifecycle, interrupter)
    }
}

/// The runner of `Lifecycle::new`: it starts right away and holds its run
/// phase until it is closed.
pub(crate) struct HoldRunner;

impl InterruptibleRunner for HoldRunner {
    fn do_run(
        self: Arc<Self>,
        _lifecycle: Lifecycle,
        interrupter: Context,
    ) -> BoxFuture<'static, ExitResult> {
        async move {
            let _ = interrupter.done().await;
            Ok(())
        }
        .boxed()
    }
}
