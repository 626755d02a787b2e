//! Debouncing of topology refreshes and fan-out of connection errors.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// The debouncer was stopped; the refresh function will not run again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("debouncer was stopped")]
pub struct DebouncerStopped;

/// The work a [`RefreshDebouncer`] coalesces.
pub type RefreshFn<E> =
    Box<dyn Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static>;

enum Command<E> {
    Debounce,
    RefreshNow(oneshot::Sender<Result<(), E>>),
    Stop,
}

/// Coalesces bursts of refresh requests into a single refresh.
///
/// [`RefreshDebouncer::debounce`] (re)arms an interval timer and the
/// refresh runs once the timer elapses; every request re-arms the full
/// interval. [`RefreshDebouncer::refresh_now`] cancels the pending timer
/// and runs the refresh immediately, returning its result. A single
/// background task owns both the timer and the refresh function, so at
/// most one refresh is in flight at any time.
pub struct RefreshDebouncer<E> {
    commands: mpsc::UnboundedSender<Command<E>>,
}

impl<E: std::fmt::Display + Send + 'static> RefreshDebouncer<E> {
    /// Spawns the debouncer task.
    pub fn new(interval: Duration, refresh: RefreshFn<E>) -> Self {
        let (commands, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let timer = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Debounce) => {
                            deadline = Some(Instant::now() + interval);
                        }
                        Some(Command::RefreshNow(done)) => {
                            deadline = None;
                            let _ = done.send(refresh().await);
                        }
                        Some(Command::Stop) | None => break,
                    },
                    () = timer => {
                        deadline = None;
                        if let Err(error) = refresh().await {
                            debug!(%error, "debounced refresh failed");
                        }
                    }
                }
            }
        });

        RefreshDebouncer { commands }
    }

    /// Requests a refresh after the debounce interval, coalescing with
    /// other pending requests.
    pub fn debounce(&self) {
        let _ = self.commands.send(Command::Debounce);
    }

    /// Cancels any pending debounced refresh and runs one immediately,
    /// returning the refresh function's result.
    pub async fn refresh_now(&self) -> Result<Result<(), E>, DebouncerStopped> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::RefreshNow(done_tx))
            .map_err(|_| DebouncerStopped)?;
        done_rx.await.map_err(|_| DebouncerStopped)
    }

    /// Stops the debouncer task. Idempotent; pending debounced refreshes
    /// are dropped.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// A single-flight gate: runs the given work unless a previous run is
/// still in progress.
#[derive(Debug)]
pub struct SimpleDebouncer {
    gate: Semaphore,
}

impl Default for SimpleDebouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleDebouncer {
    /// Creates the gate.
    pub fn new() -> Self {
        SimpleDebouncer {
            gate: Semaphore::new(1),
        }
    }

    /// Runs `work` unless another call is currently running it; returns
    /// whether the work ran.
    pub async fn debounce<F>(&self, work: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        match self.gate.try_acquire() {
            Ok(_permit) => {
                work.await;
                true
            }
            Err(_) => false,
        }
    }
}

/// Fans connection errors out to all registered listeners.
///
/// Listener channels have a capacity of one; a listener that has not
/// consumed the previous error misses the next one. Stopping closes all
/// listener channels and is safe to do more than once.
pub struct ErrorBroadcaster<E> {
    listeners: Mutex<Option<Vec<mpsc::Sender<E>>>>,
}

impl<E: Clone> Default for ErrorBroadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> ErrorBroadcaster<E> {
    /// Creates a broadcaster with no listeners.
    pub fn new() -> Self {
        ErrorBroadcaster {
            listeners: Mutex::new(Some(Vec::new())),
        }
    }

    /// Registers a new listener. A listener registered after the
    /// broadcaster was stopped observes an already closed channel.
    pub fn new_listener(&self) -> mpsc::Receiver<E> {
        let (sender, receiver) = mpsc::channel(1);
        if let Some(listeners) = self.listeners.lock().unwrap().as_mut() {
            listeners.push(sender);
        }
        receiver
    }

    /// Delivers an error to every listener that has capacity for it.
    pub fn broadcast(&self, error: E) {
        if let Some(listeners) = self.listeners.lock().unwrap().as_ref() {
            for listener in listeners {
                let _ = listener.try_send(error.clone());
            }
        }
    }

    /// Closes all listener channels. Idempotent.
    pub fn stop(&self) {
        self.listeners.lock().unwrap().take();
    }
}
