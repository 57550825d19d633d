//! Operations that replay a script of results.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Replays a queue of results, one per invocation.
///
/// Once the queue is down to its last entry, that entry is repeated for every
/// further invocation. The number of invocations is counted so tests can
/// assert on the attempt count.
///
/// ```ignore
/// let op = ScriptedOperation::new([Err(deadlock()), Err(deadlock()), Ok(42)]);
/// let value = executor.execute(|| op.call()).await?;
/// assert_eq!(op.calls(), 3);
/// ```
#[derive(Debug)]
pub struct ScriptedOperation<T, E> {
    script: Mutex<VecDeque<Result<T, E>>>,
    calls: AtomicU32,
    latency: Option<Duration>,
}

impl<T: Clone, E: Clone> ScriptedOperation<T, E> {
    /// Creates an operation that replays `script`.
    ///
    /// # Panics
    ///
    /// Panics if `script` is empty.
    pub fn new(script: impl IntoIterator<Item = Result<T, E>>) -> Self {
        let script: VecDeque<_> = script.into_iter().collect();
        assert!(!script.is_empty(), "a scripted operation needs at least one result");
        Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
            latency: None,
        }
    }

    /// An operation that fails `failures` times with `error`, then returns `value`.
    pub fn failing_then(failures: usize, error: E, value: T) -> Self {
        Self::new(
            std::iter::repeat(Err(error))
                .take(failures)
                .chain(std::iter::once(Ok(value))),
        )
    }

    /// An operation that always fails with `error`.
    pub fn always_failing(error: E) -> Self {
        Self::new([Err(error)])
    }

    /// Makes every suspending invocation take `latency` before returning.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_result(&self) -> Result<T, E> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("script mutex should not be poisoned");
        if script.len() > 1 {
            script.pop_front().expect("script has more than one entry")
        } else {
            script.front().cloned().expect("script is never empty")
        }
    }

    /// Suspending invocation, for [`Executor`](dbop::Executor).
    pub fn call(&self) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let result = self.next_result();
        let latency = self.latency;
        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            result
        }
    }

    /// Direct invocation, for [`BlockingExecutor`](dbop::BlockingExecutor).
    ///
    /// The configured latency blocks the calling thread.
    pub fn call_blocking(&self) -> Result<T, E> {
        let result = self.next_result();
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        result
    }
}
