use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, ExitResult};
use crate::lifecycle::Lifecycle;
use crate::sync::lock;

/// A unit of work for a `TaskExecutor`.
///
/// The closure receives the cancellation signal of the executor while it is
/// running, and `None` when it is drained during shutdown. Returning `true`
/// stops the executor.
///
/// Since: 0.0.0
pub struct Task(Box<dyn FnOnce(Option<&Context>) -> bool + Send>);

impl Task {
    /// Creates a task out of a closure that observes the executor's
    /// cancellation signal.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Option<&Context>) -> bool + Send + 'static,
    {
        Self(Box::new(task))
    }

    /// Creates a task out of a plain closure.
    pub fn func<F>(task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move |_| {
            task();
            false
        })
    }

    /// Creates a task that does nothing.
    pub fn nop() -> Self {
        Self::new(|_| false)
    }

    fn call(self, interrupter: Option<&Context>) -> bool {
        (self.0)(interrupter)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

struct ExecutorInner {
    name: String,
    max_task: usize,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
}

impl ExecutorInner {
    fn sender(&self) -> Result<mpsc::Sender<Task>, Error> {
        lock(&self.sender).clone().ok_or(Error::ExecutorClosed)
    }

    async fn run(&self, interrupter: Context, mut receiver: mpsc::Receiver<Task>) -> ExitResult {
        loop {
            tokio::select! {
                task = receiver.recv() => match task {
                    Some(task) => {
                        if task.call(Some(&interrupter)) {
                            debug!(lifecycle = %self.name, "task stopped the executor");
                            break;
                        }
                    }
                    None => break,
                },
                _ = interrupter.done() => break,
            }
        }

        // nobody can push anymore, the queued tasks still run so that
        // synchronous callers are released
        *lock(&self.sender) = None;
        receiver.close();
        let mut drained = 0;
        while let Some(task) = receiver.recv().await {
            task.call(None);
            drained += 1;
        }
        debug!(lifecycle = %self.name, drained, "task executor drained");
        Ok(())
    }
}

/// A bounded queue of tasks executed one at a time by the run phase of its
/// lifecycle.
///
/// Tasks can only be pushed while the executor is running; tasks still queued
/// when it closes are invoked with no cancellation signal instead of being
/// dropped.
///
/// Since: 0.0.0
#[derive(Clone)]
pub struct TaskExecutor {
    lifecycle: Lifecycle,
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    /// Creates an executor whose queue holds at most `max_task` tasks.
    ///
    /// Since: 0.0.0
    pub fn new(name: impl Into<String>, max_task: usize) -> Self {
        let name = name.into();
        let inner = Arc::new(ExecutorInner {
            name: name.clone(),
            max_task: max_task.max(1),
            sender: Mutex::new(None),
        });
        let receiver = Arc::new(Mutex::new(None));

        let (start_inner, start_receiver) = (inner.clone(), receiver.clone());
        let run_inner = inner.clone();
        let lifecycle = Lifecycle::from_interruptible_fn(
            name,
            Vec::new(),
            move |_lifecycle, _interrupter| {
                let (sender, queue) = mpsc::channel(start_inner.max_task);
                *lock(&start_inner.sender) = Some(sender);
                *lock(&start_receiver) = Some(queue);
                async { Ok(()) }
            },
            move |_lifecycle, interrupter| {
                let inner = run_inner.clone();
                let queue = lock(&receiver).take();
                async move {
                    match queue {
                        Some(queue) => inner.run(interrupter, queue).await,
                        None => Ok(()),
                    }
                }
            },
        );
        Self { lifecycle, inner }
    }

    /// Returns the lifecycle of this executor.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Queues a task, waiting for room in the queue when it is full.
    pub async fn run_async(&self, task: Task) -> ExitResult {
        let sender = self.inner.sender()?;
        sender.send(task).await.map_err(|_| Error::ExecutorClosed)
    }

    /// Queues a task and waits until it was executed.
    pub async fn run_sync(&self, task: Task) -> ExitResult {
        let (done, executed) = oneshot::channel();
        let wrapped = Task::new(move |interrupter| {
            let stop = task.call(interrupter);
            let _ = done.send(());
            stop
        });
        self.run_async(wrapped).await?;
        executed.await.map_err(|_| Error::ExecutorClosed)
    }

    /// Queues a task unless the queue is full. Returns whether the task was
    /// queued.
    pub fn try_run(&self, task: Task) -> Result<bool, Error> {
        let sender = self.inner.sender()?;
        match sender.try_send(task) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ExecutorClosed),
        }
    }

    /// Waits until every task queued before this call was executed.
    pub async fn wait(&self) -> ExitResult {
        self.run_sync(Task::nop()).await
    }
}

impl Deref for TaskExecutor {
    type Target = Lifecycle;

    fn deref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl AsRef<Lifecycle> for TaskExecutor {
    fn as_ref(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("lifecycle", &self.lifecycle)
            .field("max_task", &self.inner.max_task)
            .finish()
    }
}
