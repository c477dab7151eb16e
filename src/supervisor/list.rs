use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, ExitResult, StateErrorKind};
use crate::future::ChanFuture;
use crate::lifecycle::{Lifecycle, WeakLifecycle};
use crate::runner::{interruptible_run_fn, InterruptibleRunFn};
use crate::sync::lock;

use super::child::{
    background_child, child_channels, close_child, ChildReceivers, ChildSenders, ChildSignal,
};

/// Name of the field under which a child keeps the `ListRef` of its list.
pub const LIST_FIELD_NAME: &str = "$list";

struct HolderInner {
    index: usize,
    lifecycle: Lifecycle,
    list: ListRef,
    close_all_on_start_error: AtomicBool,
    close_all_on_exit: AtomicBool,
    close_all_on_exit_error: AtomicBool,
    stop_start_on_start_error: AtomicBool,
    close_back_on_exit: AtomicBool,
    close_back_on_exit_error: AtomicBool,
}

/// The registration of a child in a `List`, carrying its position and policy
/// flags.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct ListHolder(Arc<HolderInner>);

macro_rules! policy_flag {
    ($(#[$doc:meta])* $get:ident, $set:ident) => {
        pub fn $get(&self) -> bool {
            self.0.$get.load(Ordering::SeqCst)
        }

        $(#[$doc])*
        pub fn $set(&self, enable: bool) -> &Self {
            self.0.$get.store(enable, Ordering::SeqCst);
            self
        }
    };
}

impl ListHolder {
    /// Returns the position of the child in its list.
    pub fn index(&self) -> usize {
        self.0.index
    }

    /// Returns the child lifecycle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    /// Returns the list this child was appended to.
    pub fn list(&self) -> &ListRef {
        &self.0.list
    }

    policy_flag!(
        /// When enabled, a start failure of this child closes the children
        /// started before it and fails the list's start.
        close_all_on_start_error,
        set_close_all_on_start_error
    );
    policy_flag!(
        /// When enabled, any exit of this child closes the whole list.
        close_all_on_exit,
        set_close_all_on_exit
    );
    policy_flag!(
        /// When enabled, an exit with error of this child closes the whole
        /// list.
        close_all_on_exit_error,
        set_close_all_on_exit_error
    );
    policy_flag!(
        /// When enabled, a start failure of this child ends the start phase
        /// of the list, leaving the children after it closed.
        stop_start_on_start_error,
        set_stop_start_on_start_error
    );
    policy_flag!(
        /// When enabled, any exit of this child closes the children appended
        /// after it.
        close_back_on_exit,
        set_close_back_on_exit
    );
    policy_flag!(
        /// When enabled, an exit with error of this child closes the children
        /// appended after it.
        close_back_on_exit_error,
        set_close_back_on_exit_error
    );
}

impl AsRef<Lifecycle> for ListHolder {
    fn as_ref(&self) -> &Lifecycle {
        self.lifecycle()
    }
}

impl PartialEq for ListHolder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ListHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListHolder")
            .field("index", &self.index())
            .field("lifecycle", self.lifecycle())
            .finish()
    }
}

/// A non-owning handle to a `List`, stored in the `$list` field of every
/// child.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct ListRef {
    inner: Weak<ListInner>,
    lifecycle: WeakLifecycle,
}

impl ListRef {
    /// Returns the lifecycle of the list, if it is still alive.
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.lifecycle.upgrade()
    }

    /// Returns the sibling at the given position.
    pub fn child(&self, index: usize) -> Option<ListHolder> {
        self.inner
            .upgrade()
            .and_then(|inner| lock(&inner.children).get(index).cloned())
    }
}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListRef({:?})", self.lifecycle)
    }
}

struct ListInner {
    name: String,
    children: Mutex<Vec<ListHolder>>,
}

/// The children a list is working with during one start-run cycle.
struct Cycle {
    children: Vec<ListHolder>,
    // how many children, from the front, were asked to start
    started: usize,
    // children a close-back already took care of
    ignored: HashSet<usize>,
    senders: ChildSenders<ListHolder>,
    receivers: ChildReceivers<ListHolder>,
}

enum Decision {
    Continue,
    CloseAll(ExitResult),
}

impl ListInner {
    /// Closes the given children from the back to the front, waiting for each
    /// one before moving to the previous.
    async fn shutdown_children(&self, children: &[ListHolder], exclude: Option<usize>) {
        for child in children.iter().rev() {
            if Some(child.index()) != exclude {
                close_child(&self.name, child.lifecycle()).await;
            }
        }
    }

    async fn handle_closed(&self, cycle: &mut Cycle, signal: ChildSignal<ListHolder>) -> Decision {
        let child = signal.holder;
        let index = child.index();
        if cycle.ignored.contains(&index) {
            return Decision::Continue;
        }

        let (close_all, close_back) = match &signal.result {
            Ok(()) => {
                debug!(lifecycle = %self.name, child = index, "child closed");
                (child.close_all_on_exit(), child.close_back_on_exit())
            }
            Err(err) => {
                warn!(lifecycle = %self.name, child = index, error = %err, "child exited with error");
                (
                    child.close_all_on_exit() || child.close_all_on_exit_error(),
                    child.close_back_on_exit() || child.close_back_on_exit_error(),
                )
            }
        };

        if close_all {
            warn!(lifecycle = %self.name, child = index, "closing every child");
            let started = &cycle.children[..cycle.started];
            self.shutdown_children(started, Some(index)).await;
            return Decision::CloseAll(signal.result);
        }
        cycle.ignored.insert(index);
        if close_back && index + 1 < cycle.started {
            debug!(lifecycle = %self.name, child = index, "closing children appended after");
            let tail = &cycle.children[index + 1..cycle.started];
            self.shutdown_children(tail, None).await;
            cycle.ignored.extend(index + 1..cycle.started);
        }
        Decision::Continue
    }

    async fn start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> Result<InterruptibleRunFn, Error> {
        let (senders, receivers) = child_channels();
        let mut cycle = Cycle {
            children: lock(&self.children).clone(),
            started: 0,
            ignored: HashSet::new(),
            senders,
            receivers,
        };

        'next: for index in 0..cycle.children.len() {
            let child = cycle.children[index].clone();
            let (future, mut started_rx) = ChanFuture::channel();
            let future = Arc::new(future);
            child.lifecycle().add_started_future(future.clone());
            background_child(&self.name, child.lifecycle(), &future);
            cycle.started = index + 1;

            loop {
                tokio::select! {
                    result = &mut started_rx => {
                        match result.unwrap_or(Err(Error::Abandoned)) {
                            Ok(()) => {
                                debug!(lifecycle = %self.name, child = index, "child started");
                                let closed = cycle.senders.closed(child.clone());
                                child.lifecycle().add_closed_future(closed);
                            }
                            Err(err) => {
                                warn!(lifecycle = %self.name, child = index, error = %err, "child start failed");
                                if child.close_all_on_start_error() {
                                    lifecycle.mark_closing();
                                    let started = &cycle.children[..cycle.started];
                                    self.shutdown_children(started, Some(index)).await;
                                    return Err(Error::interrupted(&self.name, "start", Some(err)));
                                }
                                // the failed child stays in the started range, closing it
                                // again later is harmless
                                cycle.ignored.insert(index);
                                if child.stop_start_on_start_error() {
                                    break 'next;
                                }
                            }
                        }
                        continue 'next;
                    }
                    Some(signal) = cycle.receivers.closed.recv() => {
                        if let Decision::CloseAll(result) = self.handle_closed(&mut cycle, signal).await {
                            lifecycle.mark_closing();
                            return Err(Error::interrupted(&self.name, "start", result.err()));
                        }
                    }
                    _ = interrupter.done() => {
                        debug!(lifecycle = %self.name, "list start interrupted");
                        let started = &cycle.children[..cycle.started];
                        self.shutdown_children(started, None).await;
                        return Err(Error::interrupted(&self.name, "start", None));
                    }
                }
            }
        }

        debug!(lifecycle = %self.name, started = cycle.started, "list started");
        let inner = self.clone();
        Ok(interruptible_run_fn(move |lifecycle, interrupter| {
            inner.run(lifecycle, interrupter, cycle)
        }))
    }

    async fn run(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
        mut cycle: Cycle,
    ) -> ExitResult {
        loop {
            tokio::select! {
                Some(signal) = cycle.receivers.closed.recv() => {
                    if let Decision::CloseAll(result) = self.handle_closed(&mut cycle, signal).await {
                        lifecycle.mark_closing();
                        return result;
                    }
                }
                _ = interrupter.done() => {
                    self.shutdown_children(&cycle.children, None).await;
                    return Ok(());
                }
            }
        }
    }
}

/// An ordered supervisor: children start strictly one after the other, in
/// the order they were appended, and are closed in reverse order.
///
/// Later children are assumed to depend on earlier ones, so the exit of a
/// child can close only the tail of the list (`close_back_on_exit`) while the
/// children before it keep running.
///
/// A `List` dereferences to its `Lifecycle`.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct List {
    lifecycle: Lifecycle,
    inner: Arc<ListInner>,
}

impl List {
    /// Creates an empty list.
    ///
    /// Since: 0.0.0
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let inner = Arc::new(ListInner {
            name: name.clone(),
            children: Mutex::new(Vec::new()),
        });
        let supervisor = inner.clone();
        let lifecycle = Lifecycle::from_interruptible_starter_fn(
            name,
            Vec::new(),
            move |lifecycle, interrupter| supervisor.clone().start(lifecycle, interrupter),
        );
        Self { lifecycle, inner }
    }

    /// Returns the lifecycle of this list.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Appends a child. Only permitted while the list is closed.
    ///
    /// Since: 0.0.0
    pub fn append(&self, lifecycle: impl AsRef<Lifecycle>) -> Result<ListHolder, Error> {
        if !self.lifecycle.state().is_closed() {
            return Err(Error::state(StateErrorKind::NotClosed, self.lifecycle.name()));
        }
        let mut children = lock(&self.inner.children);
        let holder = ListHolder(Arc::new(HolderInner {
            index: children.len(),
            lifecycle: lifecycle.as_ref().clone(),
            list: ListRef {
                inner: Arc::downgrade(&self.inner),
                lifecycle: self.lifecycle.downgrade(),
            },
            close_all_on_start_error: AtomicBool::new(true),
            close_all_on_exit: AtomicBool::new(true),
            close_all_on_exit_error: AtomicBool::new(true),
            stop_start_on_start_error: AtomicBool::new(true),
            close_back_on_exit: AtomicBool::new(true),
            close_back_on_exit_error: AtomicBool::new(true),
        }));
        holder
            .lifecycle()
            .set_field(LIST_FIELD_NAME, holder.list().clone());
        children.push(holder.clone());
        Ok(holder)
    }

    /// Like `append`, but panics when the list is not closed.
    ///
    /// Since: 0.0.0
    pub fn must_append(&self, lifecycle: impl AsRef<Lifecycle>) -> ListHolder {
        match self.append(lifecycle) {
            Ok(holder) => holder,
            Err(err) => panic!("{}", err),
        }
    }

    /// Returns the child at the given position.
    pub fn child(&self, index: usize) -> Option<ListHolder> {
        lock(&self.inner.children).get(index).cloned()
    }

    /// Returns every child in order.
    pub fn children(&self) -> Vec<ListHolder> {
        lock(&self.inner.children).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.children).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for List {
    type Target = Lifecycle;

    fn deref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl AsRef<Lifecycle> for List {
    fn as_ref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("lifecycle", &self.lifecycle)
            .field("children", &self.len())
            .finish()
    }
}
