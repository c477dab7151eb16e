use crate::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Allows testing code to end the run phase of components on command. This
/// type is used to test asynchronous exit handling.
struct ComponentTrigger {
    // internal signaling mechanism (used by unit test)
    sender: mpsc::Sender<()>,
    // internal signaling mechanism (used by the component body)
    receiver: Arc<Mutex<mpsc::Receiver<()>>>,
    // keeps track of all the exits that have happened so far
    call_counter: Arc<Mutex<u32>>,
}

impl ComponentTrigger {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(10);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            call_counter: Arc::new(Mutex::new(0)),
        }
    }

    async fn trigger(&self) {
        let _ = self.sender.send(()).await;
    }

    /// Blocks the current routine until a trigger call is made by a test, or
    /// the component is closed. Returns true when triggered.
    async fn wait_trigger(&self, ctx: &Context) -> bool {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = receiver.recv() => true,
            _ = ctx.done() => false,
        }
    }

    async fn register_call(&self) -> u32 {
        let mut call_count = self.call_counter.lock().await;
        *call_count += 1;
        *call_count
    }

    async fn get_call_count(&self) -> u32 {
        *self.call_counter.lock().await
    }
}

impl Clone for ComponentTrigger {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            call_counter: self.call_counter.clone(),
        }
    }
}

/// Allows unit testing code to end the run phase of a component.
pub(crate) struct ComponentTriggerer(ComponentTrigger);

impl ComponentTriggerer {
    pub(crate) async fn trigger(&self) {
        self.0.trigger().await
    }

    /// Returns how many times the component exited on command.
    pub(crate) async fn get_call_count(&self) -> u32 {
        self.0.get_call_count().await
    }
}

/// Allows the creation of components that exit on command.
#[derive(Clone)]
pub(crate) struct ComponentTriggerListener(ComponentTrigger);

impl ComponentTriggerListener {
    /// Transforms this record into a component whose run phase fails on
    /// command, until a specified maximum number of times.
    pub(crate) fn to_fail_run_component(self, name: &str, max_fail_count: u32) -> Lifecycle {
        let data = self.0;
        Lifecycle::from_interruptible_fn(
            name,
            vec![],
            |_lifecycle, _ctx: Context| async { Ok(()) },
            move |_lifecycle, ctx: Context| {
                let data = data.clone();
                async move {
                    if data.get_call_count().await >= max_fail_count || !data.wait_trigger(&ctx).await {
                        let _ = ctx.done().await;
                        return Ok(());
                    }
                    let fail_count = data.register_call().await;
                    Err(Error::from(anyhow!(
                        "fail_run_component ({}/{})",
                        fail_count,
                        max_fail_count
                    )))
                }
            },
        )
    }

    /// Transforms this record into a component whose run phase returns
    /// cleanly on command.
    pub(crate) fn to_success_exit_component(self, name: &str) -> Lifecycle {
        let data = self.0;
        Lifecycle::from_interruptible_fn(
            name,
            vec![],
            |_lifecycle, _ctx: Context| async { Ok(()) },
            move |_lifecycle, ctx: Context| {
                let data = data.clone();
                async move {
                    if data.wait_trigger(&ctx).await {
                        data.register_call().await;
                    }
                    Ok(())
                }
            },
        )
    }
}

/// Creates a tuple of ComponentTriggerer and ComponentTriggerListener, these
/// types are used to create components that exit on command.
pub(crate) fn new() -> (ComponentTriggerer, ComponentTriggerListener) {
    let data = ComponentTrigger::new();
    (ComponentTriggerer(data.clone()), ComponentTriggerListener(data))
}
