use std::sync::{Arc, Mutex};

use futures::future::{pending, BoxFuture, FutureExt};
use tokio::sync::{oneshot, watch};

use crate::error::{Error, ExitResult};
use crate::sync::lock;

/// A single-assignment completion slot.
///
/// Completing a value twice is a no-op: the first write wins. Every
/// implementation is safe to complete from any thread.
///
/// Since: 0.0.0
pub trait Complete<V>: Send + Sync {
    /// Delivers the value, if none was delivered before.
    fn complete(&self, value: V);
}

/// A type-erased completion handle, the shape in which lifecycles store the
/// futures registered on them.
pub type SharedFuture<V> = Arc<dyn Complete<V>>;

impl<V, F> Complete<V> for Arc<F>
where
    F: Complete<V> + ?Sized,
{
    fn complete(&self, value: V) {
        (**self).complete(value)
    }
}

/// The future returned by `started_waiter` and `closed_waiter`; it resolves
/// once the awaited transition happens.
pub type Waiter = BoxFuture<'static, ExitResult>;

/// Turns the receiving end of a `ChanFuture` into a `Waiter`.
pub(crate) fn waiter(receiver: oneshot::Receiver<ExitResult>) -> Waiter {
    async move { receiver.await.unwrap_or(Err(Error::Abandoned)) }.boxed()
}

////////////////////////////////////////////////////////////////////////////////

/// Discards the completed value.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopFuture;

impl<V> Complete<V> for NopFuture {
    fn complete(&self, _value: V) {}
}

////////////////////////////////////////////////////////////////////////////////

/// Delivers the completed value to a single receiver through a oneshot
/// channel.
pub struct ChanFuture<V> {
    sender: Mutex<Option<oneshot::Sender<V>>>,
}

impl<V> ChanFuture<V> {
    /// Creates the future together with the receiver that gets its value.
    pub fn channel() -> (Self, oneshot::Receiver<V>) {
        let (sender, receiver) = oneshot::channel();
        let future = Self {
            sender: Mutex::new(Some(sender)),
        };
        (future, receiver)
    }
}

impl<V: Send> Complete<V> for ChanFuture<V> {
    fn complete(&self, value: V) {
        if let Some(sender) = lock(&self.sender).take() {
            // the receiver may be gone already, nobody is interested then
            let _ = sender.send(value);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Holds the completed value so that any number of tasks can wait for it,
/// before or after the completion happens.
pub struct WaiterFuture<V> {
    sender: watch::Sender<Option<V>>,
}

impl<V> Default for WaiterFuture<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> WaiterFuture<V> {
    /// Creates an empty future.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }
}

impl<V: Clone> WaiterFuture<V> {
    /// Returns the value when the future was completed already.
    pub fn try_get(&self) -> Option<V> {
        self.sender.borrow().clone()
    }

    /// Waits until the future is completed and returns a copy of its value.
    pub async fn wait(&self) -> V {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(value) = receiver.borrow_and_update().as_ref() {
                return value.clone();
            }
            if receiver.changed().await.is_err() {
                // the sender lives as long as `self`, this cannot happen
                pending::<()>().await;
            }
        }
    }
}

impl<V: Send + Sync> Complete<V> for WaiterFuture<V> {
    fn complete(&self, value: V) {
        self.sender.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

type Callback<V> = Box<dyn FnOnce(V) + Send>;

/// Invokes a callback with the completed value, on the thread that completes
/// it.
pub struct CallbackFuture<V> {
    callback: Mutex<Option<Callback<V>>>,
}

impl<V> CallbackFuture<V> {
    /// Creates a future that calls `callback` on completion.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(V) + Send + 'static,
    {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl<V> Complete<V> for CallbackFuture<V> {
    fn complete(&self, value: V) {
        // the lock is released before the callback runs
        let callback = lock(&self.callback).take();
        if let Some(callback) = callback {
            callback(value)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A thread-safe list of registered futures. Completing it fans the value
/// out to every registrant once and clears the list.
pub struct Futures<V> {
    futures: Mutex<Vec<SharedFuture<V>>>,
}

impl<V> Default for Futures<V> {
    fn default() -> Self {
        Self {
            futures: Mutex::new(Vec::new()),
        }
    }
}

impl<V> Futures<V> {
    /// Registers a future.
    pub fn append(&self, future: SharedFuture<V>) {
        lock(&self.futures).push(future);
    }

    /// Removes and returns every registered future.
    pub fn load_and_reset(&self) -> Vec<SharedFuture<V>> {
        std::mem::take(&mut *lock(&self.futures))
    }

    /// Returns how many futures are waiting.
    pub fn len(&self) -> usize {
        lock(&self.futures).len()
    }

    /// Returns true when no future is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completes every future in `futures` with a copy of `value`.
pub(crate) fn complete_all<V: Clone>(futures: Vec<SharedFuture<V>>, value: V) {
    for future in futures {
        future.complete(value.clone());
    }
}

impl<V: Clone + Send> Complete<V> for Futures<V> {
    fn complete(&self, value: V) {
        complete_all(self.load_and_reset(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_chan_future_first_write_wins() {
        let (future, receiver) = ChanFuture::channel();
        future.complete(1);
        future.complete(2);
        assert_eq!(Ok(1), receiver.await);
    }

    #[tokio::test]
    async fn test_waiter_future_many_waiters() {
        let future = Arc::new(WaiterFuture::new());
        let mut first = task::spawn({
            let future = future.clone();
            async move { future.wait().await }
        });
        assert_pending!(first.poll());
        assert_eq!(None, future.try_get());

        future.complete("done");
        future.complete("ignored");

        assert!(first.is_woken());
        assert_eq!("done", assert_ready!(first.poll()));
        // late waiters observe the same value
        assert_eq!("done", future.wait().await);
    }

    #[test]
    fn test_callback_future_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = CallbackFuture::new({
            let calls = calls.clone();
            move |value: usize| {
                calls.fetch_add(value, Ordering::SeqCst);
            }
        });
        future.complete(3);
        future.complete(4);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_futures_broadcast_and_reset() {
        let futures = Futures::default();
        let (first, first_rx) = ChanFuture::channel();
        let (second, second_rx) = ChanFuture::channel();
        futures.append(Arc::new(first));
        futures.append(Arc::new(second));
        assert_eq!(2, futures.len());

        futures.complete(7);
        assert!(futures.is_empty());
        assert_eq!(Ok(7), first_rx.await);
        assert_eq!(Ok(7), second_rx.await);

        // a completion after the reset reaches nobody
        NopFuture.complete(8);
        futures.complete(8);
    }

    #[tokio::test]
    async fn test_waiter_reports_abandoned() {
        let (future, receiver) = ChanFuture::<ExitResult>::channel();
        drop(future);
        let result = waiter(receiver).await;
        assert!(matches!(result, Err(Error::Abandoned)));
    }
}
