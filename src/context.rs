pub use futures::future::AbortHandle;

use futures::future::{abortable, pending, Aborted, BoxFuture, FutureExt, Shared};
use thiserror::Error;

/// Represents an error reported by the `Context` value.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// Gets returned after the `abort` method from an `AbortHandle` returned
    /// by a `with_cancel` call has been invoked.
    #[error("context was canceled")]
    Cancelled,
}

/// The cancellation signal handed to interruptible runners and starters.
///
/// A lifecycle mints a fresh `Context` at the beginning of every start phase;
/// the `AbortHandle` that pairs with it is what a `close` request triggers.
/// Aborting is idempotent, and once the signal fires it stays fired for every
/// clone of the `Context`, so a start that observes it and a run phase that
/// observes it later see the same outcome.
#[derive(Clone, Debug)]
pub struct Context {
    // The `Future` that signals cancellation lives inside a `Box` so that
    // different kinds of futures (Pending, Abortable, etc.) can be stored in
    // the same field; `Shared` allows many listeners and cheap clones.
    done: Shared<BoxFuture<'static, Result<(), Error>>>,
    name: String,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a `Context` that will never expire
    pub fn new() -> Self {
        Self {
            done: pending().boxed().shared(),
            name: "".to_owned(),
        }
    }

    /// Returns the name of the lifecycle that minted this `Context`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clones a given `Context` and tags it with the given lifecycle name.
    pub(crate) fn with_name(&self, name: &str) -> Self {
        let mut ctx = self.clone();
        ctx.name = name.to_owned();
        ctx
    }

    /// Clones a given `Context` and transforms it into one that can be
    /// cancelled when calling the returned `AbortHandle#abort` function.
    pub fn with_cancel(&self) -> (Self, AbortHandle) {
        let to_context_err = |r: Result<Result<(), Error>, Aborted>| match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Cancelled),
        };

        let (done, aborter) = abortable(self.done.clone());
        let done = done.map(to_context_err).boxed().shared();
        let name = self.name.clone();
        (Self { done, name }, aborter)
    }

    /// Returns a future that is used on `select!` statements to assess if we
    /// should stop what we are doing.
    pub fn done(&self) -> Shared<BoxFuture<'static, Result<(), Error>>> {
        self.done.clone()
    }

    /// Reports whether the cancellation signal has already fired, without
    /// waiting for it.
    pub fn is_done(&self) -> bool {
        self.done().now_or_never().is_some()
    }
}
