//! Pipeline composition over one consistent snapshot.
//!
//! Every upstream input (settled store values, direct selections, results of
//! other stages) is folded into a single snapshot `S` behind one lock. After
//! each change the snapshot is cloned and every bound stage builds its
//! request from that clone, so a request never mixes inputs from different
//! moments.
//!
//! Changes are dispatched one at a time: a trigger sees snapshots in the
//! order they were produced. Triggers must therefore not call
//! [`Composer::set`] synchronously; stage results arrive on the stage's own
//! task and are safe to feed back.

use crate::debounce::SettledSource;
use crate::flight::{Admission, SingleFlight, StageResult};
use crate::observer::{Observers, SubscriptionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Detach = Box<dyn FnOnce() + Send>;

struct ComposerInner<S> {
    name: String,
    snapshot: Mutex<S>,
    dispatch: Mutex<()>,
    triggers: Observers<S>,
    detachers: Mutex<Vec<Detach>>,
    closed: AtomicBool,
}

impl<S> ComposerInner<S>
where
    S: Clone + PartialEq + Send + 'static,
{
    fn apply<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut S),
    {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
            let before = snapshot.clone();
            apply(&mut snapshot);
            (*snapshot != before).then(|| snapshot.clone())
        };
        match changed {
            Some(snapshot) => {
                let fired = self.triggers.notify(&snapshot);
                tracing::trace!(composer = %self.name, fired, "snapshot changed");
                true
            }
            None => false,
        }
    }
}

/// Owns a snapshot and re-triggers bound stages whenever it changes.
pub struct Composer<S> {
    inner: Arc<ComposerInner<S>>,
}

impl<S> Clone for Composer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Composer<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        Self {
            inner: Arc::new(ComposerInner {
                name: name.into(),
                snapshot: Mutex::new(initial),
                dispatch: Mutex::new(()),
                triggers: Observers::new(),
                detachers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn weak(&self) -> Weak<ComposerInner<S>> {
        Arc::downgrade(&self.inner)
    }

    fn detachers(&self) -> MutexGuard<'_, Vec<Detach>> {
        self.inner
            .detachers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the snapshot from a source that is not debounced.
    ///
    /// Returns `true` when the snapshot changed and triggers ran.
    pub fn set<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut S),
    {
        self.inner.apply(apply)
    }

    /// A clone of the current snapshot.
    pub fn snapshot(&self) -> S {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fires every trigger with the current snapshot, changed or not.
    pub fn refresh(&self) {
        if self.is_torn_down() {
            return;
        }
        let _dispatch = self
            .inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        self.inner.triggers.notify(&snapshot);
    }

    /// Folds every settlement of `source` into the snapshot.
    pub fn bind_store<T, Src, F>(&self, source: &Src, apply: F) -> SubscriptionId
    where
        T: Clone + Send + Sync + 'static,
        Src: SettledSource<T>,
        F: Fn(&mut S, &T) + Send + Sync + 'static,
    {
        let owner = self.weak();
        source.subscribe_settled(move |value: &T| {
            if let Some(owner) = owner.upgrade() {
                owner.apply(|snapshot| apply(snapshot, value));
            }
        })
    }

    /// Requests `stage` with `build(&snapshot)` on every snapshot change.
    ///
    /// `build` returns `None` while the inputs the stage needs are missing.
    pub fn bind_stage<I, V, E, F>(&self, stage: &SingleFlight<I, V, E>, build: F) -> SubscriptionId
    where
        I: Send + 'static,
        V: Send + 'static,
        E: Send + 'static,
        F: Fn(&S) -> Option<I> + Send + Sync + 'static,
    {
        let target = stage.clone();
        let name = stage.name().to_string();
        let id = self.inner.triggers.subscribe(move |snapshot: &S| {
            if let Some(input) = build(snapshot) {
                let admission = target.request(input);
                if admission == Admission::Closed {
                    tracing::debug!(stage = %name, "bound stage already torn down");
                }
            }
        });
        let owner = self.weak();
        self.detachers().push(Box::new(move || {
            if let Some(owner) = owner.upgrade() {
                owner.triggers.unsubscribe(id);
            }
        }));
        id
    }

    /// Folds results of `stage` back into the snapshot.
    ///
    /// `apply` sees every result, including errors, and changes the
    /// snapshot in place.
    pub fn feed_stage_results<I, V, E, F>(
        &self,
        stage: &SingleFlight<I, V, E>,
        apply: F,
    ) -> SubscriptionId
    where
        I: Send + 'static,
        V: Send + 'static,
        E: Send + 'static,
        F: Fn(&mut S, &StageResult<V, E>) + Send + Sync + 'static,
    {
        let owner = self.weak();
        let id = stage.subscribe(move |result: &StageResult<V, E>| {
            if let Some(owner) = owner.upgrade() {
                owner.apply(|snapshot| apply(snapshot, result));
            }
        });
        let source = stage.clone();
        self.detachers().push(Box::new(move || {
            source.unsubscribe(id);
        }));
        id
    }

    /// Registers a plain observer of snapshot changes.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.inner.triggers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.triggers.unsubscribe(id)
    }

    /// Detaches every binding; no trigger runs after this returns.
    ///
    /// Stores and stages bound to the composer are left running. Store
    /// subscriptions made by [`bind_store`](Self::bind_store) stay
    /// registered but become no-ops.
    pub fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out a dispatch in progress.
        drop(
            self.inner
                .dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.inner.triggers.close();
        let detachers: Vec<Detach> = self.detachers().drain(..).collect();
        for detach in detachers {
            detach();
        }
        tracing::debug!(composer = %self.inner.name, "composer torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
