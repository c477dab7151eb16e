use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use crate::context::{AbortHandle, Context};
use crate::error::{Error, ExitResult, StateErrorKind};
use crate::future::{complete_all, waiter, ChanFuture, Complete, Futures, NopFuture, SharedFuture, Waiter};
use crate::runner::{
    interruptible_run_fn, CloseFn, FnInterruptibleRunner, FnInterruptibleStarter, FnRunner,
    FnStarter, HoldRunner, InterruptibleRunFn, InterruptibleRunner, InterruptibleStarter, RunFn,
    Runner, Starter,
};
use crate::state::State;
use crate::sync::lock;

mod callbacks;
mod fields;
mod opts;

pub use callbacks::{OnStartingFn, OnTransitionFn};
pub use fields::FieldValue;
pub use opts::{with_close_check, with_destroy_check, with_once, with_start_check, CheckFn, Opt};

use callbacks::Callbacks;
use fields::Fields;
use opts::{build_checks, Checks};

/// The strategy a lifecycle delegates its start, run and close work to.
enum Driver {
    Runner(Arc<dyn Runner>),
    Interruptible(Arc<dyn InterruptibleRunner>),
    Starter(Arc<dyn Starter>),
    InterruptibleStarter(Arc<dyn InterruptibleStarter>),
}

/// What a successful start phase hands to the run phase.
enum RunPhase {
    Runner(Arc<dyn Runner>),
    Interruptible(Arc<dyn InterruptibleRunner>, Context),
    Run(RunFn),
    InterruptibleRun(InterruptibleRunFn, Context),
}

/// Resources of a single start-run cycle; replaced on every start.
struct Cycle {
    abort: AbortHandle,
    close: Option<CloseFn>,
}

struct Core {
    state: State,
    err: Option<Error>,
    cycle: Option<Cycle>,
    // a start was accepted at least once
    spent: bool,
}

struct Inner {
    id: Uuid,
    name: String,
    driver: Driver,
    checks: Checks,
    core: Mutex<Core>,
    started_futures: Futures<ExitResult>,
    closed_futures: Futures<ExitResult>,
    callbacks: Callbacks,
    fields: Fields,
}

/// The state machine that drives a component through
/// `closed → starting → running → closing → closed`, any number of times.
///
/// A `Lifecycle` is a cheap handle; clones drive the same component. The
/// actual work is delegated to one of the runner flavours of the
/// `runner` module. Transition guards and state mutations happen under a
/// short lock that is never held while the start or run phases execute, so
/// a `close` issued from anywhere is observed promptly.
///
/// Start failures surface through `start`/`run`, the started futures and the
/// `on_started` callbacks. Run failures surface through the closed futures,
/// the `on_closed` callbacks and `error()`; they are never returned by
/// `close`.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

/// A non-owning handle to a `Lifecycle`.
#[derive(Clone)]
pub struct WeakLifecycle {
    inner: Weak<Inner>,
}

impl WeakLifecycle {
    /// Returns the lifecycle if it is still alive.
    pub fn upgrade(&self) -> Option<Lifecycle> {
        self.inner.upgrade().map(|inner| Lifecycle { inner })
    }
}

impl fmt::Debug for WeakLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(lifecycle) => write!(f, "WeakLifecycle({})", lifecycle),
            None => f.write_str("WeakLifecycle(dropped)"),
        }
    }
}

fn exit_result(err: Option<Error>) -> ExitResult {
    err.map_or(Ok(()), Err)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Waits for a cycle task. A panic escaping the task, which can only come
/// from a callback, is resumed on the waiting task.
async fn join_cycle(cycle: JoinHandle<ExitResult>) -> ExitResult {
    match cycle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(_) => Err(Error::Abandoned),
    }
}

/// Awaits a runner future, turning a panic into an `Error::Panicked`.
async fn guarded<T>(name: &str, phase: BoxFuture<'static, Result<T, Error>>) -> Result<T, Error> {
    match AssertUnwindSafe(phase).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Error::Panicked {
            target: name.to_owned(),
            message: panic_message(payload),
        }),
    }
}

impl Lifecycle {
    fn from_driver(name: impl Into<String>, opts: Vec<Opt>, driver: Driver) -> Self {
        let inner = Inner {
            id: Uuid::new_v4(),
            name: name.into(),
            driver,
            checks: build_checks(opts),
            core: Mutex::new(Core {
                state: State::default(),
                err: None,
                cycle: None,
                spent: false,
            }),
            started_futures: Futures::default(),
            closed_futures: Futures::default(),
            callbacks: Callbacks::default(),
            fields: Fields::default(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a component that starts right away and whose run phase holds
    /// until it is closed. Useful as a placeholder and in tests.
    ///
    /// Since: 0.0.0
    pub fn new(name: impl Into<String>, opts: Vec<Opt>) -> Self {
        Self::with_interruptible_runner(name, opts, HoldRunner)
    }

    /// Creates a component driven by the given `Runner`.
    ///
    /// Since: 0.0.0
    pub fn with_runner<R: Runner>(name: impl Into<String>, opts: Vec<Opt>, runner: R) -> Self {
        Self::from_driver(name, opts, Driver::Runner(Arc::new(runner)))
    }

    /// Creates a component driven by the given `InterruptibleRunner`.
    ///
    /// Since: 0.0.0
    pub fn with_interruptible_runner<R: InterruptibleRunner>(
        name: impl Into<String>,
        opts: Vec<Opt>,
        runner: R,
    ) -> Self {
        Self::from_driver(name, opts, Driver::Interruptible(Arc::new(runner)))
    }

    /// Creates a component driven by the given `Starter`.
    ///
    /// Since: 0.0.0
    pub fn with_starter<S: Starter>(name: impl Into<String>, opts: Vec<Opt>, starter: S) -> Self {
        Self::from_driver(name, opts, Driver::Starter(Arc::new(starter)))
    }

    /// Creates a component driven by the given `InterruptibleStarter`.
    ///
    /// Since: 0.0.0
    pub fn with_interruptible_starter<S: InterruptibleStarter>(
        name: impl Into<String>,
        opts: Vec<Opt>,
        starter: S,
    ) -> Self {
        Self::from_driver(name, opts, Driver::InterruptibleStarter(Arc::new(starter)))
    }

    /// Creates a component out of start, run and close closures. The close
    /// closure runs while the state lock is held; it must only signal the
    /// run closure to return.
    ///
    /// Since: 0.0.0
    pub fn from_fn<S, SO, R, RO, C>(
        name: impl Into<String>,
        opts: Vec<Opt>,
        start: S,
        run: R,
        close: C,
    ) -> Self
    where
        S: Fn(Lifecycle) -> SO + Send + Sync + 'static,
        SO: Future<Output = ExitResult> + Send + 'static,
        R: Fn(Lifecycle) -> RO + Send + Sync + 'static,
        RO: Future<Output = ExitResult> + Send + 'static,
        C: Fn(&Lifecycle) -> ExitResult + Send + Sync + 'static,
    {
        Self::with_runner(name, opts, FnRunner::new(start, run, close))
    }

    /// Creates a component out of start and run closures that both observe
    /// the cancellation `Context` of the current cycle.
    ///
    /// Since: 0.0.0
    pub fn from_interruptible_fn<S, SO, R, RO>(
        name: impl Into<String>,
        opts: Vec<Opt>,
        start: S,
        run: R,
    ) -> Self
    where
        S: Fn(Lifecycle, Context) -> SO + Send + Sync + 'static,
        SO: Future<Output = ExitResult> + Send + 'static,
        R: Fn(Lifecycle, Context) -> RO + Send + Sync + 'static,
        RO: Future<Output = ExitResult> + Send + 'static,
    {
        Self::with_interruptible_runner(name, opts, FnInterruptibleRunner::new(start, run))
    }

    /// Creates a component whose start closure returns the run and close
    /// functions of the cycle.
    ///
    /// Since: 0.0.0
    pub fn from_starter_fn<S, O>(name: impl Into<String>, opts: Vec<Opt>, start: S) -> Self
    where
        S: Fn(Lifecycle) -> O + Send + Sync + 'static,
        O: Future<Output = Result<(RunFn, CloseFn), Error>> + Send + 'static,
    {
        Self::with_starter(name, opts, FnStarter::new(start))
    }

    /// Creates a component whose interruptible start closure returns the run
    /// function of the cycle.
    ///
    /// Since: 0.0.0
    pub fn from_interruptible_starter_fn<S, O>(
        name: impl Into<String>,
        opts: Vec<Opt>,
        start: S,
    ) -> Self
    where
        S: Fn(Lifecycle, Context) -> O + Send + Sync + 'static,
        O: Future<Output = Result<InterruptibleRunFn, Error>> + Send + 'static,
    {
        Self::with_interruptible_starter(name, opts, FnInterruptibleStarter::new(start))
    }

    /// Creates a component that runs `run` for a single cycle and starts it
    /// right away on a new task. There is no start phase to wait for; the
    /// run closure observes the cancellation `Context` delivered by `close`.
    /// Any later start request is rejected with `StateErrorKind::Spent`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// Since: 0.0.0
    pub fn once<F, O>(name: impl Into<String>, mut opts: Vec<Opt>, run: F) -> Result<Self, Error>
    where
        F: FnOnce(Lifecycle, Context) -> O + Send + 'static,
        O: Future<Output = ExitResult> + Send + 'static,
    {
        let run = Mutex::new(Some(interruptible_run_fn(run)));
        opts.push(with_once());
        let lifecycle = Self::from_interruptible_starter_fn(name, opts, move |lifecycle, _| {
            let run = lock(&run).take();
            async move { run.ok_or_else(|| Error::state(StateErrorKind::Spent, lifecycle.name())) }
        });
        lifecycle.background()?;
        Ok(lifecycle)
    }

    /// Returns the name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns an identifier unique to this component.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> State {
        lock(&self.inner.core).state
    }

    /// Returns the error that ended the last start or run phase.
    pub fn error(&self) -> Option<Error> {
        lock(&self.inner.core).err.clone()
    }

    /// Returns a non-owning handle to this lifecycle.
    pub fn downgrade(&self) -> WeakLifecycle {
        WeakLifecycle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // transitions

    fn rejection(&self, kind: StateErrorKind) -> Error {
        Error::state(kind, self.name())
    }

    /// Validates a start request and moves to `starting`, minting the
    /// cancellation signal of the new cycle.
    fn pre_start(&self, restarting: bool) -> Result<Context, Error> {
        let interrupter = {
            let mut core = lock(&self.inner.core);
            let state = core.state;
            let rejected = if state.is_destroyed() {
                Some(StateErrorKind::Destroyed)
            } else if state.is_restarting() && !restarting {
                Some(StateErrorKind::Restarting)
            } else if state.is_closing() {
                Some(StateErrorKind::Closing)
            } else if state.is_starting() {
                Some(StateErrorKind::Starting)
            } else if state.is_running() {
                Some(StateErrorKind::Running)
            } else if self.inner.checks.once && core.spent {
                Some(StateErrorKind::Spent)
            } else {
                None
            };
            if let Some(kind) = rejected {
                return Err(self.rejection(kind));
            }
            if let Err(err) = (self.inner.checks.start)(state) {
                core.err = Some(err.clone());
                return Err(err);
            }

            core.err = None;
            core.spent = true;
            core.state.to_starting();
            let (interrupter, abort) = Context::new().with_name(self.name()).with_cancel();
            core.cycle = Some(Cycle { abort, close: None });
            interrupter
        };
        debug!(lifecycle = %self.name(), "lifecycle starting");
        self.inner.callbacks.fire_starting(self);
        Ok(interrupter)
    }

    /// Records the end of a cycle. Must be called with the state lock held.
    fn finish(core: &mut Core) {
        if core.state.is_destroying() {
            core.state.to_destroyed();
        } else {
            core.state.to_closed();
        }
        core.cycle = None;
    }

    async fn do_start(&self, interrupter: Context) -> Result<RunPhase, Error> {
        let name = self.name();
        let started = match &self.inner.driver {
            Driver::Runner(runner) => guarded(name, runner.clone().do_start(self.clone()))
                .await
                .map(|()| (RunPhase::Runner(runner.clone()), None)),
            Driver::Interruptible(runner) => {
                let start = runner.clone().do_start(self.clone(), interrupter.clone());
                guarded(name, start)
                    .await
                    .map(|()| (RunPhase::Interruptible(runner.clone(), interrupter), None))
            }
            Driver::Starter(starter) => guarded(name, starter.clone().do_start(self.clone()))
                .await
                .map(|(run, close)| (RunPhase::Run(run), Some(close))),
            Driver::InterruptibleStarter(starter) => {
                let start = starter.clone().do_start(self.clone(), interrupter.clone());
                guarded(name, start)
                    .await
                    .map(|run| (RunPhase::InterruptibleRun(run, interrupter), None))
            }
        };

        match started {
            Err(err) => {
                warn!(lifecycle = %name, error = %err, "lifecycle start failed");
                self.inner.callbacks.fire_started(self, Some(&err));
                let (started, closed) = {
                    let mut core = lock(&self.inner.core);
                    core.err = Some(err.clone());
                    Self::finish(&mut core);
                    (
                        self.inner.started_futures.load_and_reset(),
                        self.inner.closed_futures.load_and_reset(),
                    )
                };
                complete_all(started, Err(err.clone()));
                complete_all(closed, Err(err.clone()));
                Err(err)
            }
            Ok((phase, close)) => {
                debug!(lifecycle = %name, "lifecycle started");
                self.inner.callbacks.fire_started(self, None);
                let started = {
                    let mut core = lock(&self.inner.core);
                    core.state.to_running();
                    if let Some(cycle) = core.cycle.as_mut() {
                        cycle.close = close;
                    }
                    if core.state.is_closing() {
                        // a close arrived before the start phase knew how to
                        // honor it
                        self.deliver_pending_close(&core);
                    }
                    self.inner.started_futures.load_and_reset()
                };
                complete_all(started, Ok(()));
                Ok(phase)
            }
        }
    }

    fn deliver_pending_close(&self, core: &Core) {
        let close = core.cycle.as_ref().and_then(|cycle| cycle.close.as_ref());
        if let Some(close) = close {
            if let Err(err) = close(self) {
                warn!(lifecycle = %self.name(), error = %err, "lifecycle close failed");
            }
        }
    }

    async fn do_run(&self, phase: RunPhase) -> ExitResult {
        let name = self.name();
        let result = match phase {
            RunPhase::Runner(runner) => guarded(name, runner.do_run(self.clone())).await,
            RunPhase::Interruptible(runner, interrupter) => {
                guarded(name, runner.do_run(self.clone(), interrupter)).await
            }
            RunPhase::Run(run) => guarded(name, run(self.clone())).await,
            RunPhase::InterruptibleRun(run, interrupter) => {
                guarded(name, run(self.clone(), interrupter)).await
            }
        };

        match &result {
            Ok(()) => debug!(lifecycle = %name, "lifecycle closed"),
            Err(err) => warn!(lifecycle = %name, error = %err, "lifecycle exited with error"),
        }
        self.inner.callbacks.fire_closed(self, result.as_ref().err());
        let closed = {
            let mut core = lock(&self.inner.core);
            core.err = result.as_ref().err().cloned();
            Self::finish(&mut core);
            self.inner.closed_futures.load_and_reset()
        };
        complete_all(closed, result.clone());
        result
    }

    /// Runs the start phase and, when it succeeds, the run phase of a cycle on
    /// a task of its own. `started` gets the start result before the run
    /// phase begins; the handle resolves with the start error or the exit
    /// result.
    fn spawn_cycle(
        &self,
        interrupter: Context,
        started: Option<oneshot::Sender<ExitResult>>,
    ) -> JoinHandle<ExitResult> {
        let lifecycle = self.clone();
        let cycle = async move {
            let result = lifecycle.do_start(interrupter).await;
            lifecycle.enter_run_phase(result, started).await
        };
        tokio::spawn(cycle.in_current_span())
    }

    async fn enter_run_phase(
        &self,
        started: Result<RunPhase, Error>,
        reply: Option<oneshot::Sender<ExitResult>>,
    ) -> ExitResult {
        match started {
            Ok(phase) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                self.do_run(phase).await
            }
            Err(err) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Delivers a close request to the runner. Must be called with the state
    /// lock held.
    fn interrupt(&self, core: &Core) -> ExitResult {
        let cycle = core.cycle.as_ref();
        if let Some(cycle) = cycle {
            cycle.abort.abort();
        }
        match &self.inner.driver {
            Driver::Runner(runner) => runner.do_close(self),
            Driver::Starter(_) => match cycle.and_then(|cycle| cycle.close.as_ref()) {
                Some(close) => close(self),
                None => Ok(()),
            },
            Driver::Interruptible(_) | Driver::InterruptibleStarter(_) => Ok(()),
        }
    }

    /// Runs the start phase and then the run phase on a new task. Returns once
    /// the start phase is over, with its error when it failed.
    ///
    /// Dropping the returned future does not cancel the start phase, the
    /// cycle carries on and `close` still applies to it.
    ///
    /// Since: 0.0.0
    pub async fn start(&self) -> ExitResult {
        let interrupter = self.pre_start(false)?;
        let (reply, started) = oneshot::channel();
        let cycle = self.spawn_cycle(interrupter, Some(reply));
        match started.await {
            Ok(result) => result,
            Err(_) => join_cycle(cycle).await,
        }
    }

    /// Runs the start phase and then the run phase, resolving only when the
    /// run phase is over. Resolves with the start error or the exit result.
    ///
    /// Both phases execute on a task of their own; dropping the returned
    /// future leaves the component running.
    ///
    /// Since: 0.0.0
    pub async fn run(&self) -> ExitResult {
        let interrupter = self.pre_start(false)?;
        join_cycle(self.spawn_cycle(interrupter, None)).await
    }

    /// Validates the start request right away and runs both phases on a new
    /// task. The outcome is observable through the registered futures.
    ///
    /// Since: 0.0.0
    pub fn background(&self) -> ExitResult {
        let interrupter = self.pre_start(false)?;
        let _ = self.spawn_cycle(interrupter, None);
        Ok(())
    }

    /// Requests the component to close; see `close_with`.
    ///
    /// Since: 0.0.0
    pub fn close(&self) -> ExitResult {
        self.close_with(NopFuture)
    }

    /// Requests the component to close and registers `future` to be
    /// completed with the exit result once the run phase returns.
    ///
    /// A request on a closing component only queues the future, the runner is
    /// asked to close once per cycle. On a closed component the future is
    /// completed right away with the last error. The returned error only
    /// reports a request that could not be delivered.
    ///
    /// Since: 0.0.0
    pub fn close_with<F>(&self, future: F) -> ExitResult
    where
        F: Complete<ExitResult> + 'static,
    {
        let future: SharedFuture<ExitResult> = Arc::new(future);
        let delivered = {
            let mut core = lock(&self.inner.core);
            let state = core.state;
            if state.is_restarting() {
                return Err(self.rejection(StateErrorKind::Restarting));
            }
            if state.is_closed() {
                let last = exit_result(core.err.clone());
                drop(core);
                future.complete(last);
                return Ok(());
            }
            if state.is_closing() {
                self.inner.closed_futures.append(future);
                return Ok(());
            }
            (self.inner.checks.close)(state)?;
            let delivered = self.interrupt(&core);
            if delivered.is_ok() {
                core.state.to_closing();
                self.inner.closed_futures.append(future);
            }
            delivered
        };
        match &delivered {
            Ok(()) => debug!(lifecycle = %self.name(), "lifecycle closing"),
            Err(err) => warn!(lifecycle = %self.name(), error = %err, "lifecycle close failed"),
        }
        self.inner.callbacks.fire_close(self, delivered.as_ref().err());
        delivered
    }

    /// Requests the component to close and waits for the run phase to
    /// return. Resolves with the close request error only; the exit result
    /// is available through `error()`.
    ///
    /// Since: 0.0.0
    pub async fn shutdown(&self) -> ExitResult {
        let (future, receiver) = ChanFuture::channel();
        self.close_with(future)?;
        let _ = receiver.await;
        Ok(())
    }

    /// Requests the component to close and waits for the run phase to
    /// return. The outer result is the close request result, the inner one
    /// is the exit result.
    ///
    /// Since: 0.0.0
    pub async fn close_wait(&self) -> Result<ExitResult, Error> {
        let (future, receiver) = ChanFuture::channel();
        self.close_with(future)?;
        Ok(waiter(receiver).await)
    }

    /// Closes the running component and starts it again. Concurrent
    /// `start`, `close`, `destroy` and `restart` requests are rejected until
    /// the new start phase is over. On a closed component this is a start.
    ///
    /// Since: 0.0.0
    pub async fn restart(&self) -> ExitResult {
        let closing = {
            let mut core = lock(&self.inner.core);
            let state = core.state;
            let rejected = if state.is_restarting() {
                Some(StateErrorKind::Restarting)
            } else if state.is_destroying() {
                Some(StateErrorKind::Destroying)
            } else if state.is_destroyed() {
                Some(StateErrorKind::Destroyed)
            } else if state.is_closing() {
                Some(StateErrorKind::Closing)
            } else if state.is_starting() {
                Some(StateErrorKind::Starting)
            } else if self.inner.checks.once && core.spent {
                Some(StateErrorKind::Spent)
            } else {
                None
            };
            if let Some(kind) = rejected {
                return Err(self.rejection(kind));
            }
            if state.is_running() {
                (self.inner.checks.close)(state)?;
                self.interrupt(&core)?;
                core.state.to_closing();
                let (future, receiver) = ChanFuture::channel();
                self.inner.closed_futures.append(Arc::new(future));
                core.state.to_restarting();
                Some(receiver)
            } else {
                core.state.to_restarting();
                None
            }
        };

        debug!(lifecycle = %self.name(), "lifecycle restarting");
        if closing.is_some() {
            self.inner.callbacks.fire_close(self, None);
        }

        // the restarting mark is cleared even when the caller stops waiting
        let lifecycle = self.clone();
        let (reply, restarted) = oneshot::channel();
        let sequence = async move {
            if let Some(receiver) = closing {
                let _ = receiver.await;
            }
            let started = match lifecycle.pre_start(true) {
                Ok(interrupter) => lifecycle.do_start(interrupter).await,
                Err(err) => Err(err),
            };
            lock(&lifecycle.inner.core).state.to_restarted();
            lifecycle.enter_run_phase(started, Some(reply)).await
        };
        let sequence = tokio::spawn(sequence.in_current_span());
        match restarted.await {
            Ok(result) => result,
            Err(_) => join_cycle(sequence).await,
        }
    }

    /// Destroys the component; see `destroy_with`.
    ///
    /// Since: 0.0.0
    pub fn destroy(&self) -> ExitResult {
        self.destroy_with(NopFuture)
    }

    /// Like `close_with`, but the cycle ends in the terminal `destroyed`
    /// state from which no further start is permitted. A closed component is
    /// destroyed right away.
    ///
    /// Since: 0.0.0
    pub fn destroy_with<F>(&self, future: F) -> ExitResult
    where
        F: Complete<ExitResult> + 'static,
    {
        let future: SharedFuture<ExitResult> = Arc::new(future);
        let delivered = {
            let mut core = lock(&self.inner.core);
            let state = core.state;
            if state.is_destroyed() {
                let last = exit_result(core.err.clone());
                drop(core);
                future.complete(last);
                return Ok(());
            }
            if state.is_restarting() {
                return Err(self.rejection(StateErrorKind::Restarting));
            }
            (self.inner.checks.close)(state)?;
            (self.inner.checks.destroy)(state)?;
            if state.is_closed() {
                core.state.to_destroyed();
                let last = exit_result(core.err.clone());
                let orphans = self.inner.started_futures.load_and_reset();
                drop(core);
                debug!(lifecycle = %self.name(), "lifecycle destroyed");
                complete_all(orphans, Err(self.rejection(StateErrorKind::Destroyed)));
                future.complete(last);
                return Ok(());
            }
            if state.is_closing() {
                if !state.is_destroying() {
                    core.state.to_destroying();
                }
                self.inner.closed_futures.append(future);
                return Ok(());
            }
            let delivered = self.interrupt(&core);
            if delivered.is_ok() {
                core.state.to_destroying();
                self.inner.closed_futures.append(future);
            }
            delivered
        };
        debug!(lifecycle = %self.name(), "lifecycle destroying");
        self.inner.callbacks.fire_close(self, delivered.as_ref().err());
        delivered
    }

    /// Destroys the component and waits for the run phase to return. The
    /// outer result is the destroy request result, the inner one is the exit
    /// result.
    ///
    /// Since: 0.0.0
    pub async fn destroy_wait(&self) -> Result<ExitResult, Error> {
        let (future, receiver) = ChanFuture::channel();
        self.destroy_with(future)?;
        Ok(waiter(receiver).await)
    }

    /// Waits for the current run phase to return and resolves with its exit
    /// result. On a closed component it resolves right away with the last
    /// error.
    ///
    /// Since: 0.0.0
    pub async fn wait(&self) -> ExitResult {
        self.closed_waiter().await
    }

    /// Marks a component closing without delivering a close request.
    /// Supervisors use it while they unwind their children themselves.
    pub(crate) fn mark_closing(&self) {
        let mut core = lock(&self.inner.core);
        if !core.state.is_closed() && !core.state.is_closing() {
            core.state.to_closing();
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // futures

    /// Registers a future completed when the next start phase ends. When the
    /// component is running already it is completed right away.
    ///
    /// Since: 0.0.0
    pub fn add_started_future<F>(&self, future: F)
    where
        F: Complete<ExitResult> + 'static,
    {
        let future: SharedFuture<ExitResult> = Arc::new(future);
        let value = {
            let core = lock(&self.inner.core);
            if core.state.is_destroyed() {
                Err(self.rejection(StateErrorKind::Destroyed))
            } else if core.state.is_running() {
                exit_result(core.err.clone())
            } else {
                self.inner.started_futures.append(future);
                return;
            }
        };
        future.complete(value);
    }

    /// Registers a future completed when the current run phase ends. When the
    /// component is closed already it is completed right away with the last
    /// error.
    ///
    /// Since: 0.0.0
    pub fn add_closed_future<F>(&self, future: F)
    where
        F: Complete<ExitResult> + 'static,
    {
        let future: SharedFuture<ExitResult> = Arc::new(future);
        let value = {
            let core = lock(&self.inner.core);
            if core.state.is_closed() {
                exit_result(core.err.clone())
            } else {
                self.inner.closed_futures.append(future);
                return;
            }
        };
        future.complete(value);
    }

    /// Returns a `Waiter` for the next started transition; the registration
    /// happens when this method is called, not when the waiter is polled.
    ///
    /// Since: 0.0.0
    pub fn started_waiter(&self) -> Waiter {
        let (future, receiver) = ChanFuture::channel();
        self.add_started_future(future);
        waiter(receiver)
    }

    /// Returns a `Waiter` for the next closed transition; the registration
    /// happens when this method is called, not when the waiter is polled.
    ///
    /// Since: 0.0.0
    pub fn closed_waiter(&self) -> Waiter {
        let (future, receiver) = ChanFuture::channel();
        self.add_closed_future(future);
        waiter(receiver)
    }

    ////////////////////////////////////////////////////////////////////////////
    // callbacks

    /// Adds a callback invoked right before every start phase.
    pub fn on_starting<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle) + Send + Sync + 'static,
    {
        self.inner.callbacks.starting.push(Arc::new(callback));
        self
    }

    /// Adds a callback invoked when a start phase ends, with its error.
    pub fn on_started<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.started.push(Arc::new(callback));
        self
    }

    /// Adds a callback invoked when a close request is delivered.
    pub fn on_close<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.close.push(Arc::new(callback));
        self
    }

    /// Adds a callback invoked when a run phase ends, with its error.
    pub fn on_closed<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.closed.push(Arc::new(callback));
        self
    }

    /// Replaces every `on_starting` callback with the given one.
    pub fn set_on_starting<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle) + Send + Sync + 'static,
    {
        self.inner.callbacks.starting.replace(Arc::new(callback));
        self
    }

    /// Replaces every `on_started` callback with the given one.
    pub fn set_on_started<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.started.replace(Arc::new(callback));
        self
    }

    /// Replaces every `on_close` callback with the given one.
    pub fn set_on_close<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.close.replace(Arc::new(callback));
        self
    }

    /// Replaces every `on_closed` callback with the given one.
    pub fn set_on_closed<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Lifecycle, Option<&Error>) + Send + Sync + 'static,
    {
        self.inner.callbacks.closed.replace(Arc::new(callback));
        self
    }

    /// Removes every registered callback.
    pub fn clear_callbacks(&self) -> &Self {
        let callbacks = &self.inner.callbacks;
        callbacks.starting.clear();
        callbacks.started.clear();
        callbacks.close.clear();
        callbacks.closed.clear();
        self
    }

    ////////////////////////////////////////////////////////////////////////////
    // fields

    /// Returns the value stored under `name`.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.inner.fields.get(name)
    }

    /// Returns the value stored under `name` when it has type `T`.
    pub fn field_as<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.field(name).and_then(|value| value.downcast::<T>().ok())
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn set_field<T>(&self, name: impl Into<String>, value: T) -> &Self
    where
        T: Any + Send + Sync,
    {
        self.inner.fields.set(name.into(), Arc::new(value));
        self
    }

    /// Stores `value` under `name` unless a value is there already. Returns
    /// the stored value and whether it was there before.
    pub fn set_default_field<T>(&self, name: impl Into<String>, value: T) -> (FieldValue, bool)
    where
        T: Any + Send + Sync,
    {
        self.inner.fields.set_default(name.into(), Arc::new(value))
    }

    /// Removes the value stored under `name` and returns it.
    pub fn remove_field(&self, name: &str) -> Option<FieldValue> {
        self.inner.fields.remove(name)
    }

    /// Removes the value stored under `name`.
    pub fn delete_field(&self, name: &str) -> &Self {
        self.inner.fields.remove(name);
        self
    }

    /// Visits every field until `visit` returns false. The table is copied
    /// first, `visit` may modify it.
    pub fn range_field<F>(&self, mut visit: F) -> &Self
    where
        F: FnMut(&str, &FieldValue) -> bool,
    {
        for (name, value) in self.inner.fields.snapshot().iter() {
            if !visit(name, value) {
                break;
            }
        }
        self
    }

    /// Returns a copy of the field table.
    pub fn fields(&self) -> HashMap<String, FieldValue> {
        self.inner.fields.snapshot()
    }
}

impl AsRef<Lifecycle> for Lifecycle {
    fn as_ref(&self) -> &Lifecycle {
        self
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lifecycle({})[{}]", self.name(), self.state())
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        trace!(lifecycle = %self.name, "lifecycle dropped");
    }
}
