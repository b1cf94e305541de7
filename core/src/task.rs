use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Bounded task gate shared by the ingest, extraction and catalog engines.
///
/// Fan-out happens through [`Scope`]s; the scheduler's semaphore caps how
/// many tasks are inside a backend read or a filesystem write at any one
/// time. Slots are never held across a nested scope sync, so recursion of
/// arbitrary depth cannot exhaust the pool.
#[derive(Clone)]
pub struct Scheduler {
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(tasks: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(tasks.max(1))),
        }
    }

    /// Sized from the machine's available parallelism.
    pub fn with_default_parallelism() -> Self {
        let tasks = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(tasks)
    }

    /// Reserve one bounded slot. Held for the duration of a single object
    /// read or positional write.
    pub async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Task("scheduler is shut down".to_string()))
    }

    /// Open a wait-scope for a batch of sibling tasks. Scopes nest: a
    /// task may open its own scope for the subtree it is responsible for
    /// and sync it before finishing.
    pub fn scope(&self) -> Scope {
        Scope {
            tasks: JoinSet::new(),
        }
    }
}

/// Wait-group over a set of spawned tasks.
///
/// `sync` returns the first error, but only after every task has run to
/// completion; sibling tasks are never cancelled because one of them
/// failed.
pub struct Scope {
    tasks: JoinSet<Result<()>>,
}

impl Scope {
    /// Non-blocking task submission.
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Wait for every task submitted through this scope, then report the
    /// first failure, if any.
    pub async fn sync(&mut self) -> Result<()> {
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(Error::Task(err.to_string())));
            if let Err(err) = result {
                if first.is_none() {
                    first = Some(err);
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
