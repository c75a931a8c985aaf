//! Explicit observer lists.
//!
//! Stores, stages and the composer all publish through [`Observers`]: a
//! subscription list with explicit `subscribe`/`unsubscribe` and a terminal
//! `close` used during teardown. Callbacks run synchronously on the thread
//! that publishes and are invoked outside the internal lock, so an observer
//! may subscribe, unsubscribe or publish again without deadlocking.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned by [`Observers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Callback<T>)>,
}

/// A list of callbacks notified with `&T`.
pub struct Observers<T> {
    slots: Mutex<Slots<T>>,
    closed: AtomicBool,
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `observer`. After [`close`](Self::close) the callback is
    /// dropped immediately and will never run.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut slots = self.slots();
        let id = SubscriptionId(slots.next_id);
        slots.next_id += 1;
        if !self.is_closed() {
            slots.entries.push((id, Arc::new(observer)));
        }
        id
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots();
        let before = slots.entries.len();
        slots.entries.retain(|(entry, _)| *entry != id);
        slots.entries.len() != before
    }

    /// Calls every registered observer with `value`, in subscription order.
    ///
    /// Returns how many observers ran. The closed flag is re-checked before
    /// each callback, so a `close` issued by one observer stops delivery to
    /// the rest.
    pub fn notify(&self, value: &T) -> usize {
        if self.is_closed() {
            return 0;
        }
        let callbacks: Vec<Callback<T>> = self
            .slots()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        let mut delivered = 0;
        for callback in callbacks {
            if self.is_closed() {
                break;
            }
            callback(value);
            delivered += 1;
        }
        delivered
    }

    /// Detaches every observer and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slots().entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
