//! Thread-safe front for a debounced store.
//!
//! The store is moved onto its own station thread. Producers on any thread
//! push through a bounded crossbeam channel, which is the one place where
//! concurrent observations get serialized. The thread also polls the store
//! on a fixed tick so values pushed only once still settle.

use crate::config::DebounceConfig;
use crate::debounce::store::{DebouncedStore, SettledReader, SettledSource};
use crate::error::{Result, SettleError};
use crate::observer::{Observers, SubscriptionId};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::station::StationRunner;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::time::Duration;

/// Cloneable producer side of a [`StoreHandle`].
#[derive(Debug)]
pub struct StorePusher<T> {
    tx: Sender<T>,
}

impl<T> Clone for StorePusher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StorePusher<T> {
    /// Queues a raw observation, blocking while the channel is full.
    pub fn push(&self, raw: T) -> Result<()> {
        self.tx.send(raw).map_err(|_| SettleError::TornDown)
    }

    /// Queues a raw observation without blocking.
    ///
    /// Returns `Ok(false)` when the channel is full and the observation was
    /// dropped, which is harmless for a stream that repeats its values.
    pub fn try_push(&self, raw: T) -> Result<bool> {
        match self.tx.try_send(raw) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(SettleError::TornDown),
        }
    }
}

/// Options for [`StoreHandle::spawn`].
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// How often the pending value is re-evaluated without new input.
    pub poll_interval: Duration,
    /// Capacity of the inbound channel.
    pub capacity: usize,
    /// Forward settled values to a channel as well as to observers.
    pub forward_settled: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::defaults::POLL_INTERVAL_MS),
            capacity: crate::defaults::CHANNEL_CAPACITY,
            forward_settled: false,
        }
    }
}

impl HandleOptions {
    /// Creates options from the `[debounce]` configuration section.
    pub fn from_config(config: &DebounceConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            capacity: config.channel_capacity.max(1),
            forward_settled: false,
        }
    }

    pub fn with_forward_settled(mut self, forward: bool) -> Self {
        self.forward_settled = forward;
        self
    }
}

/// A debounced store running on its own thread.
pub struct StoreHandle<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    name: &'static str,
    pusher: StorePusher<T>,
    reader: SettledReader<T>,
    observers: Arc<Observers<T>>,
    settled_rx: Option<Receiver<T>>,
    runner: Option<StationRunner<DebouncedStore<T>>>,
}

impl<T> StoreHandle<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Moves `store` onto a station thread with default options.
    pub fn spawn(store: DebouncedStore<T>) -> Self {
        Self::spawn_with(store, HandleOptions::default(), Arc::new(LogReporter))
    }

    /// Moves `store` onto a station thread.
    pub fn spawn_with(
        store: DebouncedStore<T>,
        options: HandleOptions,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let name = store.name();
        let reader = store.reader();
        let observers = store.observers();
        let (tx, rx) = bounded(options.capacity.max(1));
        let (settled_tx, settled_rx) = if options.forward_settled {
            let (settled_tx, settled_rx) = bounded(options.capacity.max(1));
            (Some(settled_tx), Some(settled_rx))
        } else {
            (None, None)
        };

        let runner = StationRunner::spawn_with_tick(
            store,
            rx,
            settled_tx,
            error_reporter,
            Some(options.poll_interval),
        );

        Self {
            name,
            pusher: StorePusher { tx },
            reader,
            observers,
            settled_rx,
            runner: Some(runner),
        }
    }

    /// Queues a raw observation.
    pub fn push(&self, raw: T) -> Result<()> {
        self.pusher.push(raw)
    }

    /// A cloneable pusher for producer threads.
    pub fn pusher(&self) -> StorePusher<T> {
        self.pusher.clone()
    }

    /// The current settled value.
    pub fn current(&self) -> Option<T> {
        self.reader.get()
    }

    pub fn reader(&self) -> SettledReader<T> {
        self.reader.clone()
    }

    /// Channel of settled values, when the handle was spawned with
    /// [`HandleOptions::forward_settled`].
    pub fn settled_receiver(&self) -> Option<&Receiver<T>> {
        self.settled_rx.as_ref()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn is_running(&self) -> bool {
        self.runner.as_ref().is_some_and(StationRunner::is_running)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the station thread and detaches all observers.
    ///
    /// Observers are closed before the thread is stopped, so nothing is
    /// delivered once shutdown has begun.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    /// Like [`shutdown`](Self::shutdown) for owners that cannot give up the
    /// handle. Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        self.observers.close();
        // Unblocks a station stuck forwarding to a full settled channel.
        self.settled_rx = None;
        match self.runner.take() {
            Some(runner) => {
                runner.stop();
                runner.join().map_err(SettleError::StoreThread)
            }
            None => Ok(()),
        }
    }
}

impl<T> SettledSource<T> for StoreHandle<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscribe_settled<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(observer)
    }

    fn unsubscribe_settled(&self, id: SubscriptionId) -> bool {
        self.unsubscribe(id)
    }

    fn settled(&self) -> Option<T> {
        self.current()
    }
}

impl<T> Drop for StoreHandle<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(store = self.name, error = %e, "store thread did not stop cleanly");
        }
    }
}
