//! Single-flight async stage.
//!
//! At most one call to the operation is in flight. While it runs, the most
//! recent request waits in a pending slot of size one; older pending input
//! is overwritten (latest wins). When the call completes, its result goes to
//! the observers and the pending input, if any, starts immediately.
//!
//! ```text
//!            request                      request
//!   Idle ──────────────▶ Running ──────────────────▶ RunningWithPending(i)
//!    ▲                    │   ▲                            │   │ request: replace i
//!    └── done, no pending ┘   └──── done: start i ─────────┘   └──────┘
//! ```

use crate::config::StageConfig;
use crate::error::{Result, SettleError};
use crate::flight::operation::{Failure, Operation};
use crate::observer::{Observers, SubscriptionId};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observable phase of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightPhase {
    Idle,
    Running,
    RunningWithPending,
}

impl fmt::Display for FlightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightPhase::Idle => write!(f, "idle"),
            FlightPhase::Running => write!(f, "running"),
            FlightPhase::RunningWithPending => write!(f, "running with pending"),
        }
    }
}

enum FlightState<I> {
    Idle,
    Running,
    RunningWithPending(I),
}

impl<I> FlightState<I> {
    fn phase(&self) -> FlightPhase {
        match self {
            FlightState::Idle => FlightPhase::Idle,
            FlightState::Running => FlightPhase::Running,
            FlightState::RunningWithPending(_) => FlightPhase::RunningWithPending,
        }
    }
}

/// What happens to a request that arrives while a call is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Keep the newest request and run it next.
    #[default]
    Coalesce,
    /// Discard it; the caller is expected to ask again.
    DropWhileBusy,
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "coalesce" => Ok(OverlapPolicy::Coalesce),
            "drop_while_busy" | "drop" => Ok(OverlapPolicy::DropWhileBusy),
            other => Err(format!(
                "unknown overlap policy '{other}' (expected coalesce or drop_while_busy)"
            )),
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlapPolicy::Coalesce => write!(f, "coalesce"),
            OverlapPolicy::DropWhileBusy => write!(f, "drop_while_busy"),
        }
    }
}

/// Error side of a stage result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError<E> {
    #[error("operation failed: {0}")]
    Failed(E),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation panicked: {0}")]
    Panicked(String),
}

/// What observers of a stage receive.
pub type StageResult<V, E> = std::result::Result<V, StageError<E>>;

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The stage was idle and the call started.
    Started,
    /// A call is running; the input is now the pending one.
    Queued,
    /// A call is running and the policy discards overlapping requests.
    Dropped,
    /// The stage was torn down.
    Closed,
}

/// Options for a [`SingleFlight`].
#[derive(Debug, Clone, Default)]
pub struct FlightOptions {
    pub policy: OverlapPolicy,
    pub timeout: Option<Duration>,
}

impl FlightOptions {
    /// Creates options from the `[stage]` configuration section.
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            policy: config.overlap,
            timeout: config.timeout(),
        }
    }

    pub fn with_policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct FlightCore<I> {
    state: FlightState<I>,
    task: Option<JoinHandle<()>>,
    torn_down: bool,
}

struct FlightInner<I, V, E> {
    name: String,
    operation: Arc<dyn Operation<I, V, E>>,
    options: FlightOptions,
    runtime: Handle,
    core: Mutex<FlightCore<I>>,
    phase_tx: watch::Sender<FlightPhase>,
    observers: Observers<StageResult<V, E>>,
    /// Held while observers run, so teardown can wait for them.
    delivery: Mutex<()>,
    /// Thread currently running observers, if any.
    deliverer: Mutex<Option<ThreadId>>,
    invocations: AtomicU64,
}

/// A stage that runs at most one operation at a time.
///
/// Cloning is cheap and every clone drives the same stage. Dropping the
/// clones does not cancel a running call; use [`teardown`](Self::teardown).
pub struct SingleFlight<I, V, E> {
    inner: Arc<FlightInner<I, V, E>>,
}

impl<I, V, E> Clone for SingleFlight<I, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, V, E> SingleFlight<I, V, E>
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    /// Creates a coalescing stage without a timeout on the current runtime.
    ///
    /// Fails with [`SettleError::NoRuntime`] outside a tokio runtime.
    pub fn new<O>(name: impl Into<String>, operation: O) -> Result<Self>
    where
        O: Operation<I, V, E> + 'static,
    {
        Self::with_options(name, operation, FlightOptions::default())
    }

    /// Creates a stage on the current runtime.
    pub fn with_options<O>(
        name: impl Into<String>,
        operation: O,
        options: FlightOptions,
    ) -> Result<Self>
    where
        O: Operation<I, V, E> + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| SettleError::NoRuntime {
            message: e.to_string(),
        })?;
        Ok(Self::on_runtime(name, Arc::new(operation), options, runtime))
    }

    /// Creates a stage whose calls run on `runtime`.
    pub fn on_runtime(
        name: impl Into<String>,
        operation: Arc<dyn Operation<I, V, E>>,
        options: FlightOptions,
        runtime: Handle,
    ) -> Self {
        let (phase_tx, _) = watch::channel(FlightPhase::Idle);
        Self {
            inner: Arc::new(FlightInner {
                name: name.into(),
                operation,
                options,
                runtime,
                core: Mutex::new(FlightCore {
                    state: FlightState::Idle,
                    task: None,
                    torn_down: false,
                }),
                phase_tx,
                observers: Observers::new(),
                delivery: Mutex::new(()),
                deliverer: Mutex::new(None),
                invocations: AtomicU64::new(0),
            }),
        }
    }

    /// Asks for the operation to run with `input`.
    ///
    /// Never blocks on the operation and never starts a second concurrent
    /// call. May be called from any thread, including from an observer.
    pub fn request(&self, input: I) -> Admission {
        let inner = &self.inner;
        let mut core = inner.core();
        if core.torn_down {
            return Admission::Closed;
        }

        let admission = match std::mem::replace(&mut core.state, FlightState::Idle) {
            FlightState::Idle => {
                core.state = FlightState::Running;
                let task = inner.runtime.spawn(drive(Arc::clone(inner), input));
                core.task = Some(task);
                Admission::Started
            }
            busy if inner.options.policy == OverlapPolicy::DropWhileBusy => {
                core.state = busy;
                Admission::Dropped
            }
            FlightState::Running | FlightState::RunningWithPending(_) => {
                core.state = FlightState::RunningWithPending(input);
                Admission::Queued
            }
        };
        inner.publish_phase(&core);
        drop(core);

        tracing::debug!(stage = %inner.name, ?admission, "request");
        admission
    }

    /// Registers an observer for results, in completion order.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&StageResult<V, E>) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    pub fn phase(&self) -> FlightPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Resolves once the stage has nothing running and nothing pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.phase_tx.subscribe();
        if let Err(e) = rx.wait_for(|phase| *phase == FlightPhase::Idle).await {
            tracing::trace!(stage = %self.inner.name, error = %e, "phase channel closed");
        }
    }

    /// Number of times the operation has been called.
    pub fn invocation_count(&self) -> u64 {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    /// Aborts the running call, discards the pending input and detaches all
    /// observers. Later requests return [`Admission::Closed`].
    ///
    /// Waits for an observer callback already in progress, so no callback
    /// runs once this returns. Called from inside one of this stage's own
    /// observers, it returns without waiting.
    pub fn teardown(&self) {
        let inner = &self.inner;
        let task = {
            let mut core = inner.core();
            if core.torn_down {
                return;
            }
            core.torn_down = true;
            core.state = FlightState::Idle;
            inner.publish_phase(&core);
            core.task.take()
        };
        inner.wait_for_delivery();
        inner.observers.close();
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(stage = %inner.name, "stage torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.core().torn_down
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.inner.options.policy
    }
}

impl<I, V, E> FlightInner<I, V, E>
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    fn core(&self) -> MutexGuard<'_, FlightCore<I>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_phase(&self, core: &FlightCore<I>) {
        self.phase_tx.send_replace(core.state.phase());
    }

    fn set_deliverer(&self, deliverer: Option<ThreadId>) {
        *self.deliverer.lock().unwrap_or_else(PoisonError::into_inner) = deliverer;
    }

    /// Hands `result` to the observers. Returns `false`, delivering nothing,
    /// once the stage is torn down.
    fn deliver(&self, result: &StageResult<V, E>) -> bool {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if self.core().torn_down {
            return false;
        }
        self.set_deliverer(Some(thread::current().id()));
        let delivered = self.observers.notify(result);
        self.set_deliverer(None);
        tracing::trace!(stage = %self.name, delivered, "result delivered");
        true
    }

    fn wait_for_delivery(&self) {
        let current = thread::current().id();
        let delivering_here =
            *self.deliverer.lock().unwrap_or_else(PoisonError::into_inner) == Some(current);
        if !delivering_here {
            drop(self.delivery.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Runs one call. `None` means the result is suppressed.
    async fn invoke(&self, input: I) -> Option<StageResult<V, E>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let call = AssertUnwindSafe(self.operation.run(input)).catch_unwind();
        let outcome = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Some(Err(StageError::TimedOut(limit))),
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(Failure::Failed(error))) => Some(Err(StageError::Failed(error))),
            Ok(Err(Failure::Superseded)) => None,
            Err(payload) => Some(Err(StageError::Panicked(panic_message(payload.as_ref())))),
        }
    }
}

/// The task behind a running stage: one call per loop iteration until the
/// pending slot is empty.
async fn drive<I, V, E>(inner: Arc<FlightInner<I, V, E>>, mut input: I)
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    loop {
        let outcome = inner.invoke(input).await;

        match &outcome {
            Some(result) => {
                if result.is_err() {
                    tracing::warn!(stage = %inner.name, "operation did not produce a value");
                }
                if !inner.deliver(result) {
                    return;
                }
            }
            None => {
                if inner.core().torn_down {
                    return;
                }
                tracing::debug!(stage = %inner.name, "superseded result suppressed");
            }
        }

        let next = {
            let mut core = inner.core();
            if core.torn_down {
                return;
            }
            let next = match std::mem::replace(&mut core.state, FlightState::Idle) {
                FlightState::RunningWithPending(pending) => {
                    core.state = FlightState::Running;
                    Some(pending)
                }
                FlightState::Running | FlightState::Idle => {
                    core.task = None;
                    None
                }
            };
            inner.publish_phase(&core);
            next
        };

        match next {
            Some(pending) => input = pending,
            None => return,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
