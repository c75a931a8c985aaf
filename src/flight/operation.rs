//! The expensive async work a stage gates.
//!
//! A stage never knows what it is running: translation, inference or a
//! model download all look like `Operation::run(input) -> Result<V, Failure<E>>`.
//! Providers are handed to the stage at construction, which is also how
//! tests substitute [`MockOperation`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Why an operation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// The provider reported an error; delivered to observers.
    Failed(E),
    /// The provider gave up because newer work made this call pointless;
    /// suppressed by the stage.
    Superseded,
}

impl<E> From<E> for Failure<E> {
    fn from(error: E) -> Self {
        Failure::Failed(error)
    }
}

/// An async unit of work run by a single-flight stage.
#[async_trait]
pub trait Operation<I, V, E>: Send + Sync
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    async fn run(&self, input: I) -> Result<V, Failure<E>>;
}

/// Adapter that turns an async closure into an [`Operation`].
pub struct FnOperation<F> {
    f: F,
}

/// Wraps `f` so it can be handed to a stage.
///
/// ```
/// use settle::flight::{Failure, operation_fn};
///
/// let double = operation_fn(|n: u32| async move { Ok::<_, Failure<String>>(n * 2) });
/// # let _ = double;
/// ```
pub fn operation_fn<F>(f: F) -> FnOperation<F> {
    FnOperation { f }
}

#[async_trait]
impl<I, V, E, F, Fut> Operation<I, V, E> for FnOperation<F>
where
    I: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, Failure<E>>> + Send,
{
    async fn run(&self, input: I) -> Result<V, Failure<E>> {
        (self.f)(input).await
    }
}

type Responder<I, V, E> = Arc<dyn Fn(&I) -> Result<V, Failure<E>> + Send + Sync>;

/// Scriptable operation for tests.
///
/// Records every input it is called with, optionally sleeps, and can be
/// gated so each call waits for [`Gate::open`] before answering.
pub struct MockOperation<I, V, E> {
    calls: Arc<Mutex<Vec<I>>>,
    started: Arc<AtomicU64>,
    respond: Responder<I, V, E>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

/// Releases gated [`MockOperation`] calls one at a time.
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Lets `n` waiting (or future) calls complete.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

impl<I, V, E> MockOperation<I, V, E>
where
    I: Clone + Send + 'static,
{
    /// Creates a mock that answers every call with `respond(&input)`.
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&I) -> Result<V, Failure<E>> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicU64::new(0)),
            respond: Arc::new(respond),
            delay: None,
            gate: None,
        }
    }

    /// Makes every call sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every call wait for a permit from the returned [`Gate`].
    pub fn gated(mut self) -> (Self, Gate) {
        let permits = Arc::new(Semaphore::new(0));
        self.gate = Some(permits.clone());
        (self, Gate { permits })
    }

    /// Inputs seen so far, in call order.
    pub fn calls(&self) -> CallLog<I> {
        CallLog {
            calls: self.calls.clone(),
            started: self.started.clone(),
        }
    }
}

/// Shared view of a [`MockOperation`]'s call history.
#[derive(Debug)]
pub struct CallLog<I> {
    calls: Arc<Mutex<Vec<I>>>,
    started: Arc<AtomicU64>,
}

impl<I> Clone for CallLog<I> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            started: self.started.clone(),
        }
    }
}

impl<I: Clone> CallLog<I> {
    pub fn inputs(&self) -> Vec<I> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls that have started.
    pub fn count(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<I, V, E> Operation<I, V, E> for MockOperation<I, V, E>
where
    I: Clone + Send + Sync + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    async fn run(&self, input: I) -> Result<V, Failure<E>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(Failure::Superseded),
            }
        }
        (self.respond)(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_fn_runs_closure() {
        let op = operation_fn(|n: u32| async move { Ok::<_, Failure<String>>(n + 1) });
        assert_eq!(op.run(41).await, Ok(42));
    }

    #[tokio::test]
    async fn test_failure_from_error() {
        let op = operation_fn(|_: ()| async move {
            let failed: Result<u8, String> = Err("boom".to_string());
            Ok::<_, Failure<String>>(failed?)
        });
        assert_eq!(op.run(()).await, Err(Failure::Failed("boom".to_string())));
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let op: MockOperation<String, usize, String> = MockOperation::new(|s: &String| Ok(s.len()));
        let log = op.calls();

        assert_eq!(op.run("abc".to_string()).await, Ok(3));
        assert_eq!(op.run("de".to_string()).await, Ok(2));
        assert_eq!(log.inputs(), vec!["abc".to_string(), "de".to_string()]);
        assert_eq!(log.count(), 2);
    }

    #[tokio::test]
    async fn test_gated_mock_waits_for_permit() {
        let (op, gate) = MockOperation::<u8, u8, String>::new(|n| Ok(*n)).gated();
        let op = Arc::new(op);
        let task = {
            let op = op.clone();
            tokio::spawn(async move { op.run(7).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        gate.open(1);
        assert_eq!(task.await.unwrap(), Ok(7));
    }
}
