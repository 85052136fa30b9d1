//! Concurrent per-replica execution with aggregated failures.
//!
//! Every task runs to completion; a failure never short-circuits its
//! siblings. Cancelling the token makes unfinished tasks return promptly
//! with [`TaskError::Cancelled`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why one fan-out task produced no result.
#[derive(Error, Debug)]
pub enum TaskError<E> {
    #[error("cancelled before completion")]
    Cancelled,
    #[error("{0}")]
    Failed(E),
}

/// Every failed task of one fan-out, keyed by identity.
#[derive(Error, Debug)]
#[error("{}", FanoutFailures(.failures))]
pub struct FanoutError<K, E>
where
    K: fmt::Display,
    E: fmt::Display,
{
    pub failures: BTreeMap<K, TaskError<E>>,
}

impl<K: fmt::Display, E: fmt::Display> FanoutError<K, E> {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

struct FanoutFailures<'a, K, E>(&'a BTreeMap<K, TaskError<E>>);

impl<K: fmt::Display, E: fmt::Display> fmt::Display for FanoutFailures<'_, K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed:", self.0.len())?;
        for (id, error) in self.0 {
            write!(f, " [{id}: {error}]")?;
        }
        Ok(())
    }
}

/// Results of a fan-out: one entry per identity, `None` where the task failed.
pub type FanoutResults<K, T> = BTreeMap<K, Option<T>>;

/// Run `operation` once per identity, concurrently.
///
/// Returns the complete result map together with the combined error, which
/// is `None` when every task succeeded.
pub async fn execute_parallel<K, T, E, F, Fut>(
    ids: impl IntoIterator<Item = K>,
    cancel: &CancellationToken,
    operation: F,
) -> (FanoutResults<K, T>, Option<FanoutError<K, E>>)
where
    K: Ord + Clone + fmt::Display,
    E: fmt::Display,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let tasks = ids.into_iter().map(|id| {
        let task = operation(id.clone());
        async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                result = task => result.map_err(TaskError::Failed),
            };
            (id, outcome)
        }
    });

    let mut results = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for (id, outcome) in join_all(tasks).await {
        match outcome {
            Ok(value) => {
                results.insert(id, Some(value));
            }
            Err(error) => {
                results.insert(id.clone(), None);
                failures.insert(id, error);
            }
        }
    }

    let error = if failures.is_empty() {
        None
    } else {
        Some(FanoutError { failures })
    };
    (results, error)
}
