use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ExitResult;
use crate::future::{ChanFuture, Complete};
use crate::lifecycle::Lifecycle;
use crate::sync::lock;

/// A transition reported by a child to its supervisor.
pub(crate) struct ChildSignal<H> {
    pub(crate) holder: H,
    pub(crate) result: ExitResult,
}

/// The future a supervisor registers on a child; completing it forwards the
/// result to the supervisor's loop, tagged with the child's holder. Only the
/// first completion is forwarded.
///
/// Supervisors mint fresh channels on every start, signals of a previous cycle
/// land on a dropped receiver and vanish.
pub(crate) struct ChildContext<H> {
    holder: H,
    sender: Mutex<Option<mpsc::UnboundedSender<ChildSignal<H>>>>,
}

impl<H> Complete<ExitResult> for ChildContext<H>
where
    H: Clone + Send + Sync,
{
    fn complete(&self, result: ExitResult) {
        if let Some(sender) = lock(&self.sender).take() {
            let signal = ChildSignal {
                holder: self.holder.clone(),
                result,
            };
            let _ = sender.send(signal);
        }
    }
}

/// The sending halves of a supervisor cycle.
pub(crate) struct ChildSenders<H> {
    started: mpsc::UnboundedSender<ChildSignal<H>>,
    closed: mpsc::UnboundedSender<ChildSignal<H>>,
}

impl<H> Clone for ChildSenders<H> {
    fn clone(&self) -> Self {
        Self {
            started: self.started.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<H> ChildSenders<H> {
    pub(crate) fn started(&self, holder: H) -> ChildContext<H> {
        ChildContext {
            holder,
            sender: Mutex::new(Some(self.started.clone())),
        }
    }

    pub(crate) fn closed(&self, holder: H) -> ChildContext<H> {
        ChildContext {
            holder,
            sender: Mutex::new(Some(self.closed.clone())),
        }
    }
}

/// The receiving halves of a supervisor cycle.
pub(crate) struct ChildReceivers<H> {
    pub(crate) started: mpsc::UnboundedReceiver<ChildSignal<H>>,
    pub(crate) closed: mpsc::UnboundedReceiver<ChildSignal<H>>,
}

pub(crate) fn child_channels<H>() -> (ChildSenders<H>, ChildReceivers<H>) {
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    let senders = ChildSenders {
        started: started_tx,
        closed: closed_tx,
    };
    let receivers = ChildReceivers {
        started: started_rx,
        closed: closed_rx,
    };
    (senders, receivers)
}

/// Closes a child and waits for its run phase to return. A close request that
/// cannot be delivered is logged and skipped.
pub(crate) async fn close_child(supervisor: &str, child: &Lifecycle) {
    let (future, receiver) = ChanFuture::channel();
    if let Err(err) = child.close_with(future) {
        warn!(
            lifecycle = %supervisor,
            child = %child.name(),
            error = %err,
            "child close failed"
        );
        return;
    }
    let _ = receiver.await;
}

/// Starts a child in the background once `started` is registered on it. When
/// the child rejects the request and no start in flight is going to complete
/// `started`, the rejection is delivered through it as a start failure.
pub(crate) fn background_child<F>(supervisor: &str, child: &Lifecycle, started: &F)
where
    F: Complete<ExitResult> + ?Sized,
{
    if let Err(err) = child.background() {
        debug!(
            lifecycle = %supervisor,
            child = %child.name(),
            error = %err,
            "child not started"
        );
        let state = child.state();
        if !(state.is_starting() || state.is_restarting()) {
            started.complete(Err(err));
        }
    }
}
