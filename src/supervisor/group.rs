use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Error, ExitResult};
use crate::lifecycle::{Lifecycle, WeakLifecycle};
use crate::runner::{interruptible_run_fn, InterruptibleRunFn};
use crate::sync::lock;

use super::child::{
    background_child, child_channels, close_child, ChildReceivers, ChildSenders, ChildSignal,
};

/// Name of the field under which a child keeps the `GroupRef` of its group.
pub const GROUP_FIELD_NAME: &str = "$group";

struct HolderInner {
    name: String,
    lifecycle: Lifecycle,
    group: GroupRef,
    removed: AtomicBool,
    close_all_on_start_error: AtomicBool,
    close_all_on_exit: AtomicBool,
    close_all_on_exit_error: AtomicBool,
}

/// The registration of a child in a `Group`, carrying its policy flags.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct GroupHolder(Arc<HolderInner>);

impl GroupHolder {
    /// Returns the name the child was added with.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns the child lifecycle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.0.lifecycle
    }

    /// Returns the group this child was added to.
    pub fn group(&self) -> &GroupRef {
        &self.0.group
    }

    /// Returns true once the child was removed from its group.
    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::SeqCst)
    }

    pub fn close_all_on_start_error(&self) -> bool {
        self.0.close_all_on_start_error.load(Ordering::SeqCst)
    }

    pub fn close_all_on_exit(&self) -> bool {
        self.0.close_all_on_exit.load(Ordering::SeqCst)
    }

    pub fn close_all_on_exit_error(&self) -> bool {
        self.0.close_all_on_exit_error.load(Ordering::SeqCst)
    }

    /// When enabled, a start failure of this child tears the whole group down.
    pub fn set_close_all_on_start_error(&self, enable: bool) -> &Self {
        self.0.close_all_on_start_error.store(enable, Ordering::SeqCst);
        self
    }

    /// When enabled, any exit of this child tears the whole group down.
    pub fn set_close_all_on_exit(&self, enable: bool) -> &Self {
        self.0.close_all_on_exit.store(enable, Ordering::SeqCst);
        self
    }

    /// When enabled, an exit with error of this child tears the whole group
    /// down.
    pub fn set_close_all_on_exit_error(&self, enable: bool) -> &Self {
        self.0.close_all_on_exit_error.store(enable, Ordering::SeqCst);
        self
    }

    fn id(&self) -> Uuid {
        self.0.lifecycle.id()
    }
}

impl AsRef<Lifecycle> for GroupHolder {
    fn as_ref(&self) -> &Lifecycle {
        self.lifecycle()
    }
}

impl PartialEq for GroupHolder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for GroupHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHolder")
            .field("name", &self.name())
            .field("lifecycle", self.lifecycle())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// A non-owning handle to a `Group`, stored in the `$group` field of every
/// child.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct GroupRef {
    inner: Weak<GroupInner>,
    lifecycle: WeakLifecycle,
}

impl GroupRef {
    /// Returns the lifecycle of the group, if it is still alive.
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.lifecycle.upgrade()
    }

    /// Looks a sibling up by name.
    pub fn child(&self, name: &str) -> Option<GroupHolder> {
        self.inner.upgrade().and_then(|inner| inner.child(name))
    }
}

impl fmt::Debug for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupRef({:?})", self.lifecycle)
    }
}

#[derive(Default)]
struct Children {
    holders: Vec<GroupHolder>,
    // set while the group is starting or running; children added meanwhile
    // are started right away
    loaded: bool,
    senders: Option<ChildSenders<GroupHolder>>,
}

struct GroupInner {
    name: String,
    children: Mutex<Children>,
}

/// What a child transition asks the group to do.
enum Decision {
    Continue,
    /// Tear every sibling down, the payload is the result of the child that
    /// triggered it.
    CloseAll(ExitResult),
}

impl GroupInner {
    fn child(&self, name: &str) -> Option<GroupHolder> {
        lock(&self.children)
            .holders
            .iter()
            .find(|holder| holder.name() == name)
            .cloned()
    }

    fn reset(&self) {
        let mut children = lock(&self.children);
        children.loaded = false;
        children.senders = None;
    }

    /// Closes every child that is neither `excluded` nor removed and waits
    /// for all of them.
    async fn shutdown_children(&self, exclude: Option<&GroupHolder>) {
        let holders = lock(&self.children).holders.clone();
        let closing = holders
            .iter()
            .filter(|holder| Some(*holder) != exclude && !holder.is_removed())
            .map(|holder| close_child(&self.name, holder.lifecycle()));
        join_all(closing).await;
    }

    fn handle_started(
        &self,
        senders: &ChildSenders<GroupHolder>,
        signal: ChildSignal<GroupHolder>,
    ) -> Decision {
        let child = signal.holder;
        if child.is_removed() {
            return Decision::Continue;
        }
        match signal.result {
            Ok(()) => {
                debug!(lifecycle = %self.name, child = %child.name(), "child started");
                child.lifecycle().add_closed_future(senders.closed(child.clone()));
                Decision::Continue
            }
            Err(err) => {
                warn!(lifecycle = %self.name, child = %child.name(), error = %err, "child start failed");
                if child.close_all_on_start_error() {
                    Decision::CloseAll(Err(err))
                } else {
                    Decision::Continue
                }
            }
        }
    }

    fn handle_closed(&self, signal: ChildSignal<GroupHolder>) -> Decision {
        let child = signal.holder;
        if child.is_removed() {
            return Decision::Continue;
        }
        let close_all = match &signal.result {
            Ok(()) => {
                debug!(lifecycle = %self.name, child = %child.name(), "child closed");
                child.close_all_on_exit()
            }
            Err(err) => {
                warn!(lifecycle = %self.name, child = %child.name(), error = %err, "child exited with error");
                child.close_all_on_exit() || child.close_all_on_exit_error()
            }
        };
        if close_all {
            Decision::CloseAll(signal.result)
        } else {
            Decision::Continue
        }
    }

    async fn start(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
    ) -> Result<InterruptibleRunFn, Error> {
        let (senders, mut receivers) = child_channels();
        let holders = {
            let mut children = lock(&self.children);
            children.loaded = true;
            children.senders = Some(senders.clone());
            children.holders.clone()
        };

        for holder in holders.iter() {
            let started = Arc::new(senders.started(holder.clone()));
            holder.lifecycle().add_started_future(started.clone());
            background_child(&self.name, holder.lifecycle(), &started);
        }

        let expected: HashSet<Uuid> = holders.iter().map(GroupHolder::id).collect();
        let mut started = HashSet::new();

        while started.len() < expected.len() {
            let (decision, trigger) = tokio::select! {
                Some(signal) = receivers.started.recv() => {
                    let child = signal.holder.clone();
                    let counts = signal.result.is_ok()
                        || !child.close_all_on_start_error()
                        || child.is_removed();
                    if counts && expected.contains(&child.id()) {
                        started.insert(child.id());
                    }
                    (self.handle_started(&senders, signal), Some(child))
                }
                Some(signal) = receivers.closed.recv() => {
                    let child = signal.holder.clone();
                    (self.handle_closed(signal), Some(child))
                }
                _ = interrupter.done() => {
                    debug!(lifecycle = %self.name, "group start interrupted");
                    self.shutdown_children(None).await;
                    self.reset();
                    return Err(Error::interrupted(&self.name, "start", None));
                }
            };

            if let Decision::CloseAll(result) = decision {
                warn!(lifecycle = %self.name, "closing every child while starting");
                lifecycle.mark_closing();
                self.shutdown_children(trigger.as_ref()).await;
                self.reset();
                return Err(Error::interrupted(&self.name, "start", result.err()));
            }
        }

        debug!(lifecycle = %self.name, children = expected.len(), "group started");
        let inner = self.clone();
        Ok(interruptible_run_fn(move |lifecycle, interrupter| {
            inner.run(lifecycle, interrupter, senders, receivers)
        }))
    }

    async fn run(
        self: Arc<Self>,
        lifecycle: Lifecycle,
        interrupter: Context,
        senders: ChildSenders<GroupHolder>,
        mut receivers: ChildReceivers<GroupHolder>,
    ) -> ExitResult {
        let result = loop {
            let (decision, trigger) = tokio::select! {
                Some(signal) = receivers.started.recv() => {
                    let child = signal.holder.clone();
                    (self.handle_started(&senders, signal), child)
                }
                Some(signal) = receivers.closed.recv() => {
                    let child = signal.holder.clone();
                    (self.handle_closed(signal), child)
                }
                _ = interrupter.done() => {
                    self.shutdown_children(None).await;
                    break Ok(());
                }
            };

            if let Decision::CloseAll(result) = decision {
                warn!(lifecycle = %self.name, child = %trigger.name(), "closing every child");
                lifecycle.mark_closing();
                self.shutdown_children(Some(&trigger)).await;
                break result;
            }
        };
        self.reset();
        result
    }
}

/// An unordered supervisor of named children.
///
/// On start every child is started concurrently; the group reaches its
/// running state once each child either started or failed with a policy
/// that tolerates it. Children may be added and removed at any time; a child
/// added to a running group is started right away.
///
/// A `Group` dereferences to its `Lifecycle`, so it is started and closed like
/// any other component.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct Group {
    lifecycle: Lifecycle,
    inner: Arc<GroupInner>,
}

impl Group {
    /// Creates an empty group.
    ///
    /// Since: 0.0.0
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let inner = Arc::new(GroupInner {
            name: name.clone(),
            children: Mutex::new(Children::default()),
        });
        let supervisor = inner.clone();
        let lifecycle = Lifecycle::from_interruptible_starter_fn(
            name,
            Vec::new(),
            move |lifecycle, interrupter| supervisor.clone().start(lifecycle, interrupter),
        );
        Self { lifecycle, inner }
    }

    /// Returns the lifecycle of this group.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn group_ref(&self) -> GroupRef {
        GroupRef {
            inner: Arc::downgrade(&self.inner),
            lifecycle: self.lifecycle.downgrade(),
        }
    }

    /// Registers a child under `name`. Fails with `Error::ChildExists` when
    /// the name is taken. A child added while the group is starting or
    /// running is started right away.
    ///
    /// Since: 0.0.0
    pub fn add(
        &self,
        name: impl Into<String>,
        lifecycle: impl AsRef<Lifecycle>,
    ) -> Result<GroupHolder, Error> {
        let name = name.into();
        let lifecycle = lifecycle.as_ref().clone();
        let (holder, senders) = {
            let mut children = lock(&self.inner.children);
            if children.holders.iter().any(|holder| holder.name() == name) {
                return Err(Error::ChildExists(name));
            }
            let holder = GroupHolder(Arc::new(HolderInner {
                name,
                lifecycle,
                group: self.group_ref(),
                removed: AtomicBool::new(false),
                close_all_on_start_error: AtomicBool::new(true),
                close_all_on_exit: AtomicBool::new(true),
                close_all_on_exit_error: AtomicBool::new(true),
            }));
            holder
                .lifecycle()
                .set_field(GROUP_FIELD_NAME, holder.group().clone());
            children.holders.push(holder.clone());
            let senders = if children.loaded {
                children.senders.clone()
            } else {
                None
            };
            (holder, senders)
        };

        if let Some(senders) = senders {
            if !self.lifecycle.state().is_closing() {
                debug!(lifecycle = %self.inner.name, child = %holder.name(), "starting late child");
                let started = Arc::new(senders.started(holder.clone()));
                holder.lifecycle().add_started_future(started.clone());
                background_child(&self.inner.name, holder.lifecycle(), &started);
            }
        }
        Ok(holder)
    }

    /// Like `add`, but panics when the name is taken.
    ///
    /// Since: 0.0.0
    pub fn must_add(&self, name: impl Into<String>, lifecycle: impl AsRef<Lifecycle>) -> GroupHolder {
        match self.add(name, lifecycle) {
            Ok(holder) => holder,
            Err(err) => panic!("{}", err),
        }
    }

    /// Unregisters the child with the given name and closes it unless the
    /// group is closed. The removed child no longer affects the group.
    ///
    /// Since: 0.0.0
    pub fn remove(&self, name: &str) -> Option<GroupHolder> {
        let holder = {
            let mut children = lock(&self.inner.children);
            let index = children
                .holders
                .iter()
                .position(|holder| holder.name() == name)?;
            let holder = children.holders.remove(index);
            holder.0.removed.store(true, Ordering::SeqCst);
            holder.lifecycle().delete_field(GROUP_FIELD_NAME);
            holder
        };
        if !self.lifecycle.state().is_closed() {
            if let Err(err) = holder.lifecycle().close() {
                warn!(lifecycle = %self.inner.name, child = %holder.name(), error = %err, "removed child close failed");
            }
        }
        Some(holder)
    }

    /// Looks a child up by name.
    pub fn child(&self, name: &str) -> Option<GroupHolder> {
        self.inner.child(name)
    }

    /// Returns every child in the order they were added.
    pub fn children(&self) -> Vec<GroupHolder> {
        lock(&self.inner.children).holders.clone()
    }

    /// Returns the number of children.
    pub fn len(&self) -> usize {
        lock(&self.inner.children).holders.len()
    }

    /// Returns true when the group has no children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for Group {
    type Target = Lifecycle;

    fn deref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl AsRef<Lifecycle> for Group {
    fn as_ref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("lifecycle", &self.lifecycle)
            .field("children", &self.len())
            .finish()
    }
}
