//! One single-flight stage per key.
//!
//! Used where independent resources each need their own gate, such as one
//! model download per language: two requests for the same key coalesce,
//! requests for different keys run concurrently.

use crate::error::{Result, SettleError};
use crate::flight::operation::Operation;
use crate::flight::stage::{Admission, FlightOptions, FlightPhase, SingleFlight, StageResult};
use crate::observer::{Observers, SubscriptionId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Result delivered by a [`KeyedSingleFlight`], tagged with its key.
pub type KeyedResult<K, V, E> = (K, StageResult<V, E>);

struct KeyedInner<K, I, V, E> {
    name: String,
    operation: Arc<dyn Operation<I, V, E>>,
    options: FlightOptions,
    runtime: Handle,
    stages: Mutex<HashMap<K, SingleFlight<I, V, E>>>,
    observers: Observers<KeyedResult<K, V, E>>,
    torn_down: AtomicBool,
}

/// A family of [`SingleFlight`] stages created lazily on first request.
pub struct KeyedSingleFlight<K, I, V, E> {
    inner: Arc<KeyedInner<K, I, V, E>>,
}

impl<K, I, V, E> Clone for KeyedSingleFlight<K, I, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, I, V, E> KeyedSingleFlight<K, I, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a keyed stage on the current runtime.
    pub fn new<O>(name: impl Into<String>, operation: O, options: FlightOptions) -> Result<Self>
    where
        O: Operation<I, V, E> + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| SettleError::NoRuntime {
            message: e.to_string(),
        })?;
        Ok(Self {
            inner: Arc::new(KeyedInner {
                name: name.into(),
                operation: Arc::new(operation),
                options,
                runtime,
                stages: Mutex::new(HashMap::new()),
                observers: Observers::new(),
                torn_down: AtomicBool::new(false),
            }),
        })
    }

    fn stages(&self) -> MutexGuard<'_, HashMap<K, SingleFlight<I, V, E>>> {
        self.inner
            .stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests `input` on the stage for `key`, creating it if needed.
    pub fn request(&self, key: K, input: I) -> Admission {
        match self.stage_for(&key) {
            Some(stage) => stage.request(input),
            None => Admission::Closed,
        }
    }

    /// Requests `input` on the stage for `key` and resolves with the next
    /// result that stage delivers.
    ///
    /// When a call for `key` is already running, that call's result is the
    /// one returned. Resolves to `None` if the stage is torn down or
    /// released before it delivers.
    pub async fn request_and_wait(&self, key: K, input: I) -> Option<StageResult<V, E>> {
        let stage = self.stage_for(&key)?;
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let subscription = Subscription {
            id: stage.subscribe(move |result: &StageResult<V, E>| {
                let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx
                    && tx.send(result.clone()).is_err()
                {
                    tracing::trace!("keyed waiter went away");
                }
            }),
            stage: &stage,
        };
        if stage.request(input) == Admission::Closed {
            return None;
        }
        let result = rx.await.ok();
        drop(subscription);
        result
    }

    /// The stage for `key`, created on first use. `None` once torn down.
    fn stage_for(&self, key: &K) -> Option<SingleFlight<I, V, E>> {
        let mut stages = self.stages();
        // Checked under the map lock so teardown's drain cannot miss a stage.
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return None;
        }
        let stage = stages
            .entry(key.clone())
            .or_insert_with(|| self.create_stage(key))
            .clone();
        Some(stage)
    }

    fn create_stage(&self, key: &K) -> SingleFlight<I, V, E> {
        let stage = SingleFlight::on_runtime(
            format!("{}[{key:?}]", self.inner.name),
            Arc::clone(&self.inner.operation),
            self.inner.options.clone(),
            self.inner.runtime.clone(),
        );
        let owner: Weak<KeyedInner<K, I, V, E>> = Arc::downgrade(&self.inner);
        let tag = key.clone();
        stage.subscribe(move |result: &StageResult<V, E>| {
            if let Some(owner) = owner.upgrade() {
                owner.observers.notify(&(tag.clone(), result.clone()));
            }
        });
        tracing::debug!(stage = %self.inner.name, ?key, "created keyed stage");
        stage
    }

    /// Phase of the stage for `key`; keys never requested are idle.
    pub fn phase(&self, key: &K) -> FlightPhase {
        self.stages()
            .get(key)
            .map_or(FlightPhase::Idle, SingleFlight::phase)
    }

    /// Resolves once the stage for `key` is idle.
    pub async fn wait_idle(&self, key: &K) {
        let stage = self.stages().get(key).cloned();
        if let Some(stage) = stage {
            stage.wait_idle().await;
        }
    }

    /// Resolves once every stage is idle.
    pub async fn wait_all_idle(&self) {
        let stages: Vec<_> = self.stages().values().cloned().collect();
        for stage in stages {
            stage.wait_idle().await;
        }
    }

    /// True when no key has a call running or pending.
    pub fn is_idle(&self) -> bool {
        self.stages()
            .values()
            .all(|stage| stage.phase() == FlightPhase::Idle)
    }

    /// Tears down the stage for `key` and forgets it.
    ///
    /// A running call for that key is aborted and its result discarded. A
    /// later request for the same key starts a fresh stage.
    pub fn release(&self, key: &K) -> bool {
        let removed = self.stages().remove(key);
        match removed {
            Some(stage) => {
                stage.teardown();
                tracing::debug!(stage = %self.inner.name, ?key, "released keyed stage");
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.stages().keys().cloned().collect()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&KeyedResult<K, V, E>) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Tears down every stage and detaches all observers.
    ///
    /// Requests racing with teardown either land on a stage that is drained
    /// here or return [`Admission::Closed`].
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.observers.close();
        let stages: Vec<_> = self.stages().drain().map(|(_, stage)| stage).collect();
        for stage in stages {
            stage.teardown();
        }
        tracing::debug!(stage = %self.inner.name, "keyed stage torn down");
    }
}

/// Removes a waiter's observer when the waiter finishes or is dropped.
struct Subscription<'a, I: Send + 'static, V: Send + 'static, E: Send + 'static> {
    stage: &'a SingleFlight<I, V, E>,
    id: SubscriptionId,
}

impl<I: Send + 'static, V: Send + 'static, E: Send + 'static> Drop for Subscription<'_, I, V, E> {
    fn drop(&mut self) {
        self.stage.unsubscribe(self.id);
    }
}
