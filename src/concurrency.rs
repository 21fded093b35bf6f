//! Error aggregation and the parallel fan-out combinator.
//!
//! Every parallel phase in the wrangler has the same shape: one future per
//! shard or tablet, all joined before the phase returns, every failure kept.
//! [`for_each_parallel`] is that shape; [`ErrorSet`] is where the failures go.

use crate::error::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;

/// Append-only, thread-safe collection of errors.
///
/// Reduces to no error, the single recorded error, or an
/// [`Error::Aggregate`] holding all of them.
#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Mutex<Vec<Error>>,
}

impl ErrorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the error of `result`, if any. `Ok` is a no-op.
    pub fn record(&self, result: Result<()>) {
        if let Err(e) = result {
            self.record_error(e);
        }
    }

    /// Record an error. Aggregates are flattened so every message stays
    /// individually retrievable.
    pub fn record_error(&self, error: Error) {
        self.errors.lock().extend(error.into_errors());
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Copy of every recorded error, in recording order.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// The reduced result.
    pub fn result(&self) -> Result<()> {
        let errors = self.errors.lock();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors[0].clone()),
            _ => Err(Error::Aggregate(errors.clone())),
        }
    }
}

/// Run `f` once per target, all concurrently, and wait for every one.
///
/// Each failure is recorded into `errors`; one failing target never stops its
/// siblings. Nothing is still running when this returns.
pub async fn for_each_parallel<T, F, Fut>(
    targets: impl IntoIterator<Item = T>,
    errors: &ErrorSet,
    f: F,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let tasks = targets.into_iter().map(|target| {
        let task = f(target);
        async move { errors.record(task.await) }
    });
    join_all(tasks).await;
}
