//! The lifecycle crate gives any unit of concurrent work (a server, a
//! connection, a background job) a uniform state machine on top of the tokio
//! runtime, and composes such units into supervision trees. The crate
//! provides:
//!
//! * A `Lifecycle` type that drives a component through
//!   `closed → starting → running → closing → closed`, with restart and
//!   destroy phases, completion futures, transition callbacks and a field
//!   table
//!
//! * `Runner`, `InterruptibleRunner`, `Starter` and `InterruptibleStarter`
//!   traits to plug the work of a component into a `Lifecycle`
//!
//! * `Group` and `List` supervisors that start children concurrently or in
//!   order, and tear them down according to per-child policies
//!
//! * A `Retryable` wrapper that restarts a failing child after a delay
//!
//! * A `TaskExecutor` that runs queued closures on a lifecycle's run phase
//!
//! * A `Context` type to signal cancellation to interruptible components

/// This module provides the `Context` type, the cancellation signal handed to
/// interruptible runners.
pub mod context;
pub use context::Context;

/// Provides the `State` bitset of a lifecycle.
pub mod state;
pub use state::State;

/// Provides the error types reported by lifecycles and supervisors.
pub mod error;
pub use error::{
    Error, ErrorSink, ExitResult, FailureKind, InterruptedError, StateError, StateErrorKind,
};

/// Provides single-assignment completion slots used to observe transitions.
pub mod future;
pub use future::{
    CallbackFuture, ChanFuture, Complete, Futures, NopFuture, SharedFuture, Waiter, WaiterFuture,
};

/// Provides the strategies a lifecycle delegates its work to.
pub mod runner;
pub use runner::{
    close_fn, interruptible_run_fn, run_fn, CloseFn, InterruptibleRunFn, InterruptibleRunner,
    InterruptibleStarter, RunFn, Runner, Starter,
};

/// Contains the lifecycle state machine.
pub mod lifecycle;
pub use lifecycle::{
    with_close_check, with_destroy_check, with_once, with_start_check, CheckFn, FieldValue,
    Lifecycle, Opt, WeakLifecycle,
};

/// Contains the `Group` and `List` supervisors.
pub mod supervisor;
pub use supervisor::{Group, GroupHolder, GroupRef, List, ListHolder, ListRef};

/// Provides a wrapper that restarts a failing child.
pub mod retryable;
pub use retryable::Retryable;

/// Provides a generic retry loop for fallible operations.
pub mod retry;
pub use retry::{Retry, RetryContext};

/// Provides a bounded queue of closures executed by a lifecycle.
pub mod task;
pub use task::{Task, TaskExecutor};

/// Provides an API to notify and collect lifecycle events.
pub mod events;
pub use events::{Event, EventListener};

/// Re-exports the types most programs need.
pub mod prelude;

mod sync;

#[cfg(test)]
mod tests;
