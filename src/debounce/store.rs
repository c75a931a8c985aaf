//! Debounced value store.
//!
//! Holds a single settled value and publishes to observers only after raw
//! input has been stable for the quiet period. The store is owned by one
//! execution context (`&mut self` for `push`); to feed it from several
//! threads, move it into a [`StoreHandle`](super::StoreHandle).

use crate::clock::{Clock, SystemClock};
use crate::config::DebounceConfig;
use crate::debounce::debouncer::{Debouncer, PushOutcome};
use crate::error::{Result, SettleError};
use crate::observer::{Observers, SubscriptionId};
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Something that publishes settled values to subscribers.
///
/// Implemented by [`DebouncedStore`] and [`StoreHandle`](super::StoreHandle)
/// so the composer can bind to either.
pub trait SettledSource<T> {
    /// Registers an observer for settled values.
    fn subscribe_settled<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static;

    /// Removes an observer registered with [`subscribe_settled`](Self::subscribe_settled).
    fn unsubscribe_settled(&self, id: SubscriptionId) -> bool;

    /// The current settled value.
    fn settled(&self) -> Option<T>;
}

/// Read-only view of a store's settled value, usable from any thread.
#[derive(Debug)]
pub struct SettledReader<T> {
    cell: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for SettledReader<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> SettledReader<T> {
    /// Returns the last published value without waiting on the store.
    pub fn get(&self) -> Option<T> {
        self.cell
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn validate_quiet_period(quiet_period: Duration) -> Result<Duration> {
    let max = Duration::from_millis(crate::defaults::MAX_QUIET_PERIOD_MS.unsigned_abs());
    if quiet_period > max {
        return Err(SettleError::ConfigInvalidValue {
            key: "quiet_period".to_string(),
            message: format!("{quiet_period:?} exceeds the maximum of {max:?}"),
        });
    }
    Ok(quiet_period)
}

/// Store that turns raw observations into settled values.
pub struct DebouncedStore<T> {
    name: &'static str,
    debouncer: Debouncer<T>,
    clock: Arc<dyn Clock>,
    observers: Arc<Observers<T>>,
    settled: Arc<RwLock<Option<T>>>,
    torn_down: bool,
}

impl<T> DebouncedStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a store with no settled value yet.
    ///
    /// Fails if the quiet period exceeds
    /// [`MAX_QUIET_PERIOD_MS`](crate::defaults::MAX_QUIET_PERIOD_MS).
    pub fn new(quiet_period: Duration) -> Result<Self> {
        let quiet_period = validate_quiet_period(quiet_period)?;
        Ok(Self {
            name: "debounce",
            debouncer: Debouncer::new(quiet_period),
            clock: Arc::new(SystemClock),
            observers: Arc::new(Observers::new()),
            settled: Arc::new(RwLock::new(None)),
            torn_down: false,
        })
    }

    /// Creates a store from the `[debounce]` configuration section.
    pub fn from_config(config: &DebounceConfig) -> Result<Self> {
        Self::new(config.quiet_period()?)
    }

    /// Sets the value reported before anything settles.
    pub fn with_initial(mut self, initial: T) -> Self {
        self.debouncer = Debouncer::with_initial(self.debouncer.quiet_period(), initial.clone());
        *self.settled.write().unwrap_or_else(PoisonError::into_inner) = Some(initial);
        self
    }

    /// Sets a custom clock (for deterministic testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Names the store in logs and station reports.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Records a raw observation.
    ///
    /// Returns the newly settled value when this push published one. Observers
    /// run synchronously on the calling thread before this returns.
    pub fn push(&mut self, raw: T) -> Option<T> {
        if self.torn_down {
            return None;
        }
        let outcome = self.debouncer.observe(raw, self.clock.now());
        self.after(outcome)
    }

    /// Re-evaluates the pending raw value against the clock.
    pub fn poll(&mut self) -> Option<T> {
        if self.torn_down {
            return None;
        }
        let outcome = self.debouncer.poll(self.clock.now());
        self.after(outcome)
    }

    fn after(&mut self, outcome: PushOutcome) -> Option<T> {
        match outcome {
            PushOutcome::Settled => {
                let value = self.debouncer.settled().cloned()?;
                *self.settled.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(value.clone());
                let delivered = self.observers.notify(&value);
                tracing::debug!(store = self.name, delivered, "value settled");
                Some(value)
            }
            PushOutcome::Armed => {
                tracing::trace!(store = self.name, "raw value changed, timer re-armed");
                None
            }
            PushOutcome::Waiting | PushOutcome::Unchanged | PushOutcome::Empty => None,
        }
    }

    /// The last published value (or the initial value).
    pub fn current(&self) -> Option<T> {
        self.debouncer.settled().cloned()
    }

    /// The raw value waiting to settle.
    pub fn pending(&self) -> Option<&T> {
        self.debouncer.pending()
    }

    /// A cloneable reader of the settled value for other threads.
    pub fn reader(&self) -> SettledReader<T> {
        SettledReader {
            cell: Arc::clone(&self.settled),
        }
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

    pub(crate) fn observers(&self) -> Arc<Observers<T>> {
        Arc::clone(&self.observers)
    }

    /// Detaches every observer; later pushes are ignored.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.observers.close();
        tracing::debug!(store = self.name, "store torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn quiet_period(&self) -> Duration {
        self.debouncer.quiet_period()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> SettledSource<T> for DebouncedStore<T>
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

impl<T> Station for DebouncedStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    fn process(&mut self, input: T) -> std::result::Result<Option<T>, StationError> {
        if self.torn_down {
            return Err(StationError::Fatal(format!("store '{}' torn down", self.name)));
        }
        Ok(self.push(input))
    }

    fn tick(&mut self) -> std::result::Result<Option<T>, StationError> {
        Ok(self.poll())
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn shutdown(&mut self) {
        self.teardown();
    }
}
