use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The outcome of a start or run phase, and the value every lifecycle
/// future is completed with.
pub type ExitResult = Result<(), Error>;

/// Enumerates the states an operation may be rejected in.
///
/// Since: 0.0.0
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateErrorKind {
    /// The start phase is executing.
    Starting,
    /// The run phase is executing.
    Running,
    /// The operation requires a running component.
    NotRunning,
    /// A close request is in progress.
    Closing,
    /// The component is closed.
    Closed,
    /// The operation requires a closed component.
    NotClosed,
    /// A restart sequence is in progress.
    Restarting,
    /// A destroy request is in progress.
    Destroying,
    /// The component was destroyed.
    Destroyed,
    /// The component runs a single cycle and already ran it.
    Spent,
}

impl StateErrorKind {
    /// Returns the human readable description of this kind.
    pub fn description(self) -> &'static str {
        match self {
            StateErrorKind::Starting => "is starting",
            StateErrorKind::Running => "is running",
            StateErrorKind::NotRunning => "is not running",
            StateErrorKind::Closing => "is closing",
            StateErrorKind::Closed => "is closed",
            StateErrorKind::NotClosed => "is not closed",
            StateErrorKind::Restarting => "is restarting",
            StateErrorKind::Destroying => "is being destroyed",
            StateErrorKind::Destroyed => "was destroyed",
            StateErrorKind::Spent => "already ran its single cycle",
        }
    }
}

/// Reported when an operation is illegal for the current state of a
/// `Lifecycle`. These errors are local: the caller may retry once the
/// component reaches a valid state.
///
/// Since: 0.0.0
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("lifecycle `{target}` {}", .kind.description())]
pub struct StateError {
    /// What state rejected the operation.
    pub kind: StateErrorKind,
    /// Name of the lifecycle that rejected the operation.
    pub target: String,
}

impl StateError {
    pub(crate) fn new(kind: StateErrorKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

/// Reported when a supervisor gives up on an action (usually its start)
/// because a child failed or because it was asked to close half-way.
///
/// When a child error triggered the unwind it is kept untouched as the
/// `source` of this error.
///
/// Since: 0.0.0
#[derive(Clone, Debug)]
pub struct InterruptedError {
    /// Name of the interrupted component.
    pub target: String,
    /// The action that was interrupted (e.g. "start").
    pub action: String,
    cause: Option<Arc<Error>>,
}

impl InterruptedError {
    pub(crate) fn new(
        target: impl Into<String>,
        action: impl Into<String>,
        cause: Option<Error>,
    ) -> Self {
        Self {
            target: target.into(),
            action: action.into(),
            cause: cause.map(Arc::new),
        }
    }

    /// Returns the child error that caused the interruption, if any.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {} was interrupted", self.target, self.action)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for InterruptedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Unifies every error reported by this crate, together with the errors
/// returned by user supplied runners.
///
/// Since: 0.0.0
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The operation is not valid for the current state.
    #[error("{0}")]
    State(#[from] StateError),
    /// A supervisor unwound an action.
    #[error("{0}")]
    Interrupted(#[from] InterruptedError),
    /// A supervisor already has a child with the given name.
    #[error("child `{0}` already exists")]
    ChildExists(String),
    /// A task was submitted to an executor that is not running.
    #[error("task executor is closed")]
    ExecutorClosed,
    /// A start or run phase panicked.
    #[error("lifecycle `{target}` panicked: {message}")]
    Panicked {
        /// Name of the lifecycle whose runner panicked.
        target: String,
        /// The panic payload, when it was a string.
        message: String,
    },
    /// A future was dropped before it was completed.
    #[error("future was dropped before completion")]
    Abandoned,
    /// An error returned by user code.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl Error {
    /// Builds an `Error::Failed` value out of a plain message.
    pub fn msg<M>(msg: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Returns the state error when this error is one.
    pub fn as_state_error(&self) -> Option<&StateError> {
        match self {
            Error::State(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true when the error reports a rejected state transition of the
    /// given kind.
    pub fn is_state(&self, kind: StateErrorKind) -> bool {
        matches!(self.as_state_error(), Some(err) if err.kind == kind)
    }

    /// Returns true when the error is an `InterruptedError`.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }

    pub(crate) fn state(kind: StateErrorKind, target: &str) -> Self {
        Error::State(StateError::new(kind, target))
    }

    pub(crate) fn interrupted(target: &str, action: &str, cause: Option<Error>) -> Self {
        Error::Interrupted(InterruptedError::new(target, action, cause))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // errors produced by this crate travel through user code untouched
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::Failed(Arc::new(err)),
        }
    }
}

/// Classifies the failures reported to an `ErrorSink`.
///
/// Since: 0.0.0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// A child failed to start.
    Start,
    /// A child's run phase returned an error.
    Exit,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Start => f.write_str("start"),
            FailureKind::Exit => f.write_str("exit"),
        }
    }
}

/// A side-effect callback that receives the failures a component observes
/// but does not propagate.
pub type ErrorSink = Arc<dyn Fn(FailureKind, &Error) + Send + Sync>;

/// The sink used when none is configured; it logs the failure.
pub(crate) fn log_sink(target: String) -> ErrorSink {
    Arc::new(move |kind: FailureKind, err: &Error| {
        tracing::warn!(lifecycle = %target, kind = %kind, error = %err, "child failure");
    })
}
