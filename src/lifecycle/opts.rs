use crate::error::ExitResult;
use crate::state::State;

/// A guard evaluated while a transition is being decided. It receives the
/// current state and may reject the transition with an error.
pub type CheckFn = Box<dyn Fn(State) -> ExitResult + Send + Sync>;

/// The checks a lifecycle evaluates before starting, closing and destroying.
pub(crate) struct Checks {
    pub(crate) start: CheckFn,
    pub(crate) close: CheckFn,
    pub(crate) destroy: CheckFn,
    /// Permits a single start-run cycle.
    pub(crate) once: bool,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            start: Box::new(|_| Ok(())),
            close: Box::new(|_| Ok(())),
            destroy: Box::new(|_| Ok(())),
            once: false,
        }
    }
}

/// Represents a configuration option for a `Lifecycle`.
///
/// Since: 0.0.0
pub struct Opt(Box<dyn FnOnce(&mut Checks) + Send + Sync + 'static>);

impl Opt {
    pub(crate) fn new<F>(opt_fn: F) -> Self
    where
        F: FnOnce(&mut Checks) + Send + Sync + 'static,
    {
        Self(Box::new(opt_fn))
    }

    pub(crate) fn call(self, checks: &mut Checks) {
        self.0(checks)
    }
}

/// Builds the checks of a lifecycle out of the given options.
pub(crate) fn build_checks(opts: Vec<Opt>) -> Checks {
    let mut checks = Checks::default();
    for opt in opts {
        opt.call(&mut checks);
    }
    checks
}

/// Registers a guard evaluated before every start. Returning an error aborts
/// the start and becomes the error reported by `Lifecycle::start`.
///
/// Since: 0.0.0
pub fn with_start_check<F>(check: F) -> Opt
where
    F: Fn(State) -> ExitResult + Send + Sync + 'static,
{
    Opt::new(move |checks| checks.start = Box::new(check))
}

/// Registers a guard evaluated before a close request is delivered.
///
/// Since: 0.0.0
pub fn with_close_check<F>(check: F) -> Opt
where
    F: Fn(State) -> ExitResult + Send + Sync + 'static,
{
    Opt::new(move |checks| checks.close = Box::new(check))
}

/// Registers a guard evaluated before a destroy request, after the close
/// guard.
///
/// Since: 0.0.0
pub fn with_destroy_check<F>(check: F) -> Opt
where
    F: Fn(State) -> ExitResult + Send + Sync + 'static,
{
    Opt::new(move |checks| checks.destroy = Box::new(check))
}

/// Limits the lifecycle to a single start-run cycle. Once the first start
/// was accepted, every later `start`, `run`, `background` or `restart` is
/// rejected with `StateErrorKind::Spent`; closing, waiting and destroying keep
/// working.
///
/// Since: 0.0.0
pub fn with_once() -> Opt {
    Opt::new(|checks| checks.once = true)
}
