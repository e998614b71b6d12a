use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::Notify;

use crate::error::{EvalError, EvalResult};
use crate::value::Value;

/// State of an in-flight asynchronous computation. Transitions exactly once
/// from `Pending` to a terminal state.
#[derive(Debug, Clone)]
pub enum FutureState {
    Pending,
    Resolved(Value),
    Rejected(EvalError),
}

/// A single-assignment, eventually-settling handle to an asynchronously
/// produced value or error.
///
/// Cloning shares the same underlying state; any number of observers may
/// await the same future and all see the same outcome. There is no
/// cancellation: a computation always runs to completion, only the waiter's
/// patience is bounded by [`FutureValue::settled_timeout`].
#[derive(Clone)]
pub struct FutureValue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<FutureState>,
    notify: Notify,
}

impl Default for FutureValue {
    fn default() -> Self {
        Self::pending()
    }
}

impl FutureValue {
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FutureState::Pending),
                notify: Notify::new(),
            }),
        }
    }

    pub fn resolved(value: Value) -> Self {
        let future = Self::pending();
        future.resolve(value);
        future
    }

    /// Settles the future with a value. First settlement wins; later calls
    /// are ignored.
    pub fn resolve(&self, value: Value) {
        self.settle(FutureState::Resolved(value));
    }

    /// Settles the future with an error. First settlement wins.
    pub fn reject(&self, error: EvalError) {
        self.settle(FutureState::Rejected(error));
    }

    fn settle(&self, terminal: FutureState) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !matches!(*state, FutureState::Pending) {
                return;
            }
            *state = terminal;
        }
        self.inner.notify.notify_waiters();
    }

    fn try_outcome(&self) -> Option<EvalResult<Value>> {
        match &*self.inner.state.lock().unwrap() {
            FutureState::Pending => None,
            FutureState::Resolved(value) => Some(Ok(value.clone())),
            FutureState::Rejected(error) => Some(Err(error.clone())),
        }
    }

    /// Waits until the future settles, yielding its value or propagating
    /// its error.
    pub async fn settled(&self) -> EvalResult<Value> {
        loop {
            // Register interest before checking state so a settlement
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Like [`settled`](Self::settled), but fails with a timeout error when
    /// the deadline elapses first. The future itself is not settled by a
    /// timeout; a late settlement is simply never observed by this waiter.
    pub async fn settled_timeout(&self, timeout: Duration) -> EvalResult<Value> {
        tokio::time::timeout(timeout, self.settled())
            .await
            .unwrap_or(Err(EvalError::AwaitTimeout(timeout)))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), FutureState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), FutureState::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), FutureState::Rejected(_))
    }

    /// Non-blocking peek at the resolved value.
    pub fn value(&self) -> Option<Value> {
        match &*self.inner.state.lock().unwrap() {
            FutureState::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match &*self.inner.state.lock().unwrap() {
            FutureState::Pending => "pending",
            FutureState::Resolved(_) => "resolved",
            FutureState::Rejected(_) => "rejected",
        }
    }

    /// Identity comparison: two handles to the same settlement.
    pub fn same_future(&self, other: &FutureValue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Starts a computation on its own task and returns its future immediately.
pub fn run_async<F>(computation: F) -> FutureValue
where
    F: Future<Output = EvalResult<Value>> + Send + 'static,
{
    let future = FutureValue::pending();
    let handle = future.clone();
    tokio::spawn(async move {
        match computation.await {
            Ok(value) => handle.resolve(value),
            Err(error) => handle.reject(error),
        }
    });
    future
}

/// Awaits every future and resolves to the ordered list of their values,
/// failing fast with the first rejection encountered.
pub fn all(futures: Vec<FutureValue>) -> FutureValue {
    run_async(async move {
        let mut values = Vec::with_capacity(futures.len());
        for future in &futures {
            values.push(future.settled().await?);
        }
        Ok(Value::array(values))
    })
}

/// Settles with whichever input future settles first, value or error,
/// regardless of the order the futures were supplied in.
pub fn race(futures: Vec<FutureValue>) -> FutureValue {
    if futures.is_empty() {
        let result = FutureValue::pending();
        result.reject(EvalError::Eval("race requires at least one future".to_string()));
        return result;
    }
    run_async(async move {
        let waiters: Vec<_> = futures
            .iter()
            .map(|future| Box::pin(future.settled()))
            .collect();
        let (outcome, _, _) = select_all(waiters).await;
        outcome
    })
}
