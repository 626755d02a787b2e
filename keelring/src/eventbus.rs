//! A generic event bus with named subscribers and per-subscriber filters.
//!
//! One dispatcher task fans incoming events out to every subscriber.
//! Distribution never blocks: a subscriber whose buffer is full misses
//! the event. Subscribers therefore must treat the stream as lossy and
//! resynchronize through other means (e.g. a full topology refresh) when
//! they fall behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::errors::EventBusError;

/// Configuration of an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the input queue events are published into.
    pub input_queue_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig {
            input_queue_size: 128,
        }
    }
}

/// A predicate deciding whether a subscriber wants an event.
pub type EventFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initialized,
    Started,
    Stopped,
}

struct SubscriberEntry<T> {
    sender: mpsc::Sender<T>,
    filter: Option<EventFilter<T>>,
}

struct BusInner<T> {
    input_tx: mpsc::Sender<T>,
    input_rx: Mutex<Option<mpsc::Receiver<T>>>,
    subscribers: Mutex<HashMap<String, SubscriberEntry<T>>>,
    status: Mutex<Status>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T> BusInner<T> {
    fn remove_subscriber(&self, name: &str) -> Result<(), EventBusError> {
        // Dropping the entry drops its sender, which closes the
        // subscriber's channel.
        match self.subscribers.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(EventBusError::SubscriberNotFound),
        }
    }
}

/// A handle to a subscription: an owned receiving end plus the ability to
/// unsubscribe.
pub struct Subscriber<T> {
    name: String,
    receiver: mpsc::Receiver<T>,
    bus: Weak<BusInner<T>>,
}

impl<T> Subscriber<T> {
    /// Name this subscription was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives the next event. Returns `None` once the subscription has
    /// been removed or the bus stopped, after the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Receives an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Unsubscribes. The channel is closed; buffered events can still be
    /// drained.
    pub fn stop(&self) -> Result<(), EventBusError> {
        let Some(bus) = self.bus.upgrade() else {
            return Err(EventBusError::SubscriberNotFound);
        };
        bus.remove_subscriber(&self.name)
    }
}

/// An event bus distributing cloned events to named subscribers.
///
/// The lifecycle is `Initialized → Started → Stopped`, driven by
/// [`EventBus::start`] and [`EventBus::stop`]; a stopped bus cannot be
/// restarted. Subscribing works in every state, but events only flow
/// while the bus is started.
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a bus in the `Initialized` state.
    pub fn new(config: EventBusConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(config.input_queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        EventBus {
            inner: Arc::new(BusInner {
                input_tx,
                input_rx: Mutex::new(Some(input_rx)),
                subscribers: Mutex::new(HashMap::new()),
                status: Mutex::new(Status::Initialized),
                shutdown,
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Starts the dispatcher task.
    pub fn start(&self) -> Result<(), EventBusError> {
        let mut status = self.inner.status.lock().unwrap();
        match *status {
            Status::Started => return Err(EventBusError::AlreadyStarted),
            Status::Stopped => return Err(EventBusError::AlreadyStopped),
            Status::Initialized => {}
        }

        let mut input_rx = self
            .inner
            .input_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(EventBusError::AlreadyStarted)?;
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let bus = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = input_rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(bus) = bus.upgrade() else { break };
                        dispatch(&bus, event);
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.inner.dispatcher.lock().unwrap() = Some(handle);
        *status = Status::Started;
        Ok(())
    }

    /// Stops the dispatcher and closes every subscriber channel.
    pub async fn stop(&self) -> Result<(), EventBusError> {
        {
            let mut status = self.inner.status.lock().unwrap();
            match *status {
                Status::Initialized => return Err(EventBusError::NotStarted),
                Status::Stopped => return Err(EventBusError::AlreadyStopped),
                Status::Started => *status = Status::Stopped,
            }
        }

        let _ = self.inner.shutdown.send(true);
        let handle = self.inner.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.subscribers.lock().unwrap().clear();
        Ok(())
    }

    /// Publishes an event without blocking. Returns whether the event was
    /// accepted; a full input queue rejects it.
    pub fn publish(&self, event: T) -> bool {
        self.input_tx_send(event)
    }

    fn input_tx_send(&self, event: T) -> bool {
        match self.inner.input_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("event bus input queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Publishes an event, waiting for input queue capacity.
    pub async fn publish_blocking(&self, event: T) -> bool {
        self.inner.input_tx.send(event).await.is_ok()
    }

    /// Registers a named subscriber with its own buffer and an optional
    /// filter. A subscriber registered under an existing name replaces
    /// the previous one.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        buffer: usize,
        filter: Option<EventFilter<T>>,
    ) -> Subscriber<T> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(name.clone(), SubscriberEntry { sender, filter });
        Subscriber {
            name,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Like [`EventBus::subscribe`], but the subscription is removed
    /// automatically when the given future completes.
    pub fn subscribe_with_shutdown(
        &self,
        name: impl Into<String>,
        buffer: usize,
        filter: Option<EventFilter<T>>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Subscriber<T> {
        let subscriber = self.subscribe(name, buffer, filter);
        let bus = Arc::downgrade(&self.inner);
        let name = subscriber.name.clone();
        tokio::spawn(async move {
            shutdown.await;
            if let Some(bus) = bus.upgrade() {
                let _ = bus.remove_subscriber(&name);
            }
        });
        subscriber
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

fn dispatch<T: Clone>(bus: &BusInner<T>, event: T) {
    let subscribers = bus.subscribers.lock().unwrap();
    for (name, entry) in subscribers.iter() {
        if let Some(filter) = &entry.filter {
            if !filter(&event) {
                continue;
            }
        }
        match entry.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = %name, "subscriber buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = %name, "subscriber channel closed");
            }
        }
    }
}

impl<T> std::fmt::Display for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[EventBus status={:?} subscribers={}]",
            *self.inner.status.lock().unwrap(),
            self.inner.subscribers.lock().unwrap().len()
        )
    }
}
