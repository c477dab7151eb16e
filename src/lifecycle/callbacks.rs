use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::sync::lock;

use super::Lifecycle;

/// Invoked right before the start phase runs.
pub type OnStartingFn = Arc<dyn Fn(&Lifecycle) + Send + Sync>;

/// Invoked after a transition, with the error that ended it (if any).
pub type OnTransitionFn = Arc<dyn Fn(&Lifecycle, Option<&Error>) + Send + Sync>;

/// A FIFO list of callbacks behind its own lock. The list is copied before
/// invoking it, so a callback may register further callbacks; it must not
/// drive the lifecycle that invokes it.
pub(crate) struct CallbackList<F>(Mutex<Vec<F>>);

impl<F: Clone> CallbackList<F> {
    pub(crate) fn push(&self, callback: F) {
        lock(&self.0).push(callback);
    }

    pub(crate) fn replace(&self, callback: F) {
        let mut callbacks = lock(&self.0);
        callbacks.clear();
        callbacks.push(callback);
    }

    pub(crate) fn clear(&self) {
        lock(&self.0).clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<F> {
        lock(&self.0).clone()
    }
}

impl<F> Default for CallbackList<F> {
    fn default() -> Self {
        Self(Mutex::new(Vec::new()))
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) starting: CallbackList<OnStartingFn>,
    pub(crate) started: CallbackList<OnTransitionFn>,
    pub(crate) close: CallbackList<OnTransitionFn>,
    pub(crate) closed: CallbackList<OnTransitionFn>,
}

impl Callbacks {
    pub(crate) fn fire_starting(&self, lifecycle: &Lifecycle) {
        for callback in self.starting.snapshot() {
            callback(lifecycle)
        }
    }

    pub(crate) fn fire_started(&self, lifecycle: &Lifecycle, err: Option<&Error>) {
        fire(&self.started, lifecycle, err)
    }

    pub(crate) fn fire_close(&self, lifecycle: &Lifecycle, err: Option<&Error>) {
        fire(&self.close, lifecycle, err)
    }

    pub(crate) fn fire_closed(&self, lifecycle: &Lifecycle, err: Option<&Error>) {
        fire(&self.closed, lifecycle, err)
    }
}

fn fire(list: &CallbackList<OnTransitionFn>, lifecycle: &Lifecycle, err: Option<&Error>) {
    for callback in list.snapshot() {
        callback(lifecycle, err)
    }
}
