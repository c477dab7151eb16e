use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{self, JoinHandle};
use tokio::time;

use crate::error::Error;
use crate::lifecycle::Lifecycle;

/// Event represents the transitions a lifecycle goes through, as observed by
/// an `EventListener` attached to it.
#[derive(Debug, Clone)]
pub enum Event {
    Starting(NodeData),
    Started(NodeData),
    StartFailed(NodeData, Error),
    Closing(NodeData),
    CloseFailed(NodeData, Error),
    Closed(NodeData),
    ExitFailed(NodeData, Error),
}

impl Event {
    /// Returns the details about the producer of the event.
    pub fn node_data(&self) -> &NodeData {
        match self {
            Event::Starting(data)
            | Event::Started(data)
            | Event::StartFailed(data, _)
            | Event::Closing(data)
            | Event::CloseFailed(data, _)
            | Event::Closed(data)
            | Event::ExitFailed(data, _) => data,
        }
    }
}

/// NodeData holds details about the lifecycle that produced the event
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub name: String,
    pub at: DateTime<Utc>,
}

impl NodeData {
    fn of(lifecycle: &Lifecycle) -> Self {
        NodeData {
            name: lifecycle.name().to_owned(),
            at: Utc::now(),
        }
    }
}

type NotifyFn = Box<dyn Fn(Event) + Send + Sync>;

/// EventListener receives the events of every lifecycle it is attached to.
///
/// The notify function is invoked synchronously on the task performing the
/// transition; it must not block.
#[derive(Clone)]
pub struct EventListener(Arc<NotifyFn>);

impl EventListener {
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        EventListener(Arc::new(Box::new(notify)))
    }

    pub fn from_mpsc(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self::new(move |ev: Event| {
            let _ = sender.send(ev);
        })
    }

    fn notify(&self, ev: Event) {
        (self.0)(ev)
    }

    /// Subscribes this listener to the transitions of `lifecycle`.
    pub fn attach(&self, lifecycle: &Lifecycle) {
        let listener = self.clone();
        lifecycle.on_starting(move |lifecycle| {
            listener.notify(Event::Starting(NodeData::of(lifecycle)))
        });
        let listener = self.clone();
        lifecycle.on_started(move |lifecycle, err| {
            let data = NodeData::of(lifecycle);
            match err {
                None => listener.notify(Event::Started(data)),
                Some(err) => listener.notify(Event::StartFailed(data, err.clone())),
            }
        });
        let listener = self.clone();
        lifecycle.on_close(move |lifecycle, err| {
            let data = NodeData::of(lifecycle);
            match err {
                None => listener.notify(Event::Closing(data)),
                Some(err) => listener.notify(Event::CloseFailed(data, err.clone())),
            }
        });
        let listener = self.clone();
        lifecycle.on_closed(move |lifecycle, err| {
            let data = NodeData::of(lifecycle);
            match err {
                None => listener.notify(Event::Closed(data)),
                Some(err) => listener.notify(Event::ExitFailed(data, err.clone())),
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/// EventBufferCollector is an event listener that collects all the events
/// published by the lifecycles a listener is attached to. It later can be
/// used to assert events that have happened.
pub struct EventBufferCollector {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
    join_handle: JoinHandle<()>,
}

impl EventBufferCollector {
    pub fn from_mpsc(receiver: mpsc::UnboundedReceiver<Event>) -> EventBufferCollector {
        let events = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let join_handle = task::spawn(run_event_collector(
            events.clone(),
            notify.clone(),
            receiver,
        ));
        EventBufferCollector {
            events,
            notify,
            join_handle,
        }
    }

    /// get_events returns the events that have happened so far
    pub async fn get_events(&self) -> Vec<Event> {
        let events = self.events.lock().await;
        (*events).clone()
    }

    /// assert_exact checks that the accumulated events that have happened so
    /// far match the given assertions in order.
    pub async fn assert_exact(&self, asserts: Vec<EventAssert>) {
        let events = self.get_events().await;
        assert_eq!(events.len(), asserts.len(), "{:?}", events);
        for (ev, assert) in events.into_iter().zip(asserts.into_iter()) {
            assert.check(&ev)
        }
    }

    /// wait_till blocks until an event matching `assert` was collected, or
    /// panics once `timeout` elapsed.
    pub async fn wait_till(&self, assert: EventAssert, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self
                    .get_events()
                    .await
                    .iter()
                    .any(|ev| assert.call(ev).is_none())
                {
                    return;
                }
                notified.await;
            }
        };
        if time::timeout(timeout, wait).await.is_err() {
            panic!(
                "wait_till timed out; events so far: {:?}",
                self.get_events().await
            );
        }
    }
}

impl Drop for EventBufferCollector {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

////////////////////////////////////////////////////////////////////////////////

/// EventAssert is a well-defined function that asserts properties from an
/// Event emitted by a lifecycle.
pub struct EventAssert(Box<dyn Fn(&Event) -> Option<String> + Send + Sync>);

impl EventAssert {
    fn call(&self, ev: &Event) -> Option<String> {
        (*self.0)(ev)
    }

    pub fn check(&self, ev: &Event) {
        let result = self.call(ev);
        if let Some(err_msg) = result {
            panic!("EventAssert failed: {}", err_msg);
        };
    }
}

fn named_assert<F>(label: &'static str, input_name0: &str, matches: F) -> EventAssert
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    let input_name = input_name0.to_owned();
    EventAssert(Box::new(move |ev| {
        if !matches(ev) {
            Some(format!("Expecting {}; got {:?} instead", label, ev))
        } else if ev.node_data().name != input_name {
            Some(format!(
                "Expecting {} with name {}; got {:?} instead",
                label, input_name, ev
            ))
        } else {
            None
        }
    }))
}

/// starting asserts an event that tells a lifecycle with the given name
/// entered its start phase
pub fn starting(input_name: &str) -> EventAssert {
    named_assert("Starting", input_name, |ev| matches!(ev, Event::Starting(_)))
}

/// started asserts an event that tells a lifecycle with the given name
/// started
pub fn started(input_name: &str) -> EventAssert {
    named_assert("Started", input_name, |ev| matches!(ev, Event::Started(_)))
}

pub fn start_failed(input_name: &str) -> EventAssert {
    named_assert("StartFailed", input_name, |ev| {
        matches!(ev, Event::StartFailed(..))
    })
}

/// closing asserts an event that tells a close request was delivered to a
/// lifecycle with the given name
pub fn closing(input_name: &str) -> EventAssert {
    named_assert("Closing", input_name, |ev| matches!(ev, Event::Closing(_)))
}

/// closed asserts an event that tells a lifecycle with the given name
/// finished its run phase without error
pub fn closed(input_name: &str) -> EventAssert {
    named_assert("Closed", input_name, |ev| matches!(ev, Event::Closed(_)))
}

pub fn exit_failed(input_name: &str) -> EventAssert {
    named_assert("ExitFailed", input_name, |ev| {
        matches!(ev, Event::ExitFailed(..))
    })
}

/// run_event_collector is an internal function that receives lifecycle events
/// from a channel and stores them on a thread-safe buffer.
async fn run_event_collector(
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
    mut receiver: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(ev) = receiver.recv().await {
        let mut ev_vec = events.lock().await;
        ev_vec.push(ev);
        notify.notify_waiters();
    }
}

/// new_testing_listener returns an `EventListener` that sends its events to
/// an EventBufferCollector.
pub fn new_testing_listener() -> (EventListener, EventBufferCollector) {
    let (send_ev, rx_ev) = mpsc::unbounded_channel();
    let listener = EventListener::from_mpsc(send_ev);
    let buffer = EventBufferCollector::from_mpsc(rx_ev);
    (listener, buffer)
}
