pub use anyhow::anyhow;
pub use futures::FutureExt;
pub use tokio::time::Duration;

pub use crate::context::Context;
pub use crate::error::{Error, ExitResult, FailureKind, StateErrorKind};
pub use crate::future::{ChanFuture, Complete, NopFuture, WaiterFuture};
pub use crate::lifecycle::{
    with_close_check, with_destroy_check, with_once, with_start_check, Lifecycle,
};
pub use crate::retry::Retry;
pub use crate::retryable::Retryable;
pub use crate::runner::{close_fn, interruptible_run_fn, run_fn};
pub use crate::supervisor::{Group, List};
pub use crate::task::{Task, TaskExecutor};
