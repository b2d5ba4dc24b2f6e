//! Task spawning abstraction for single-threaded cooperative execution.
//!
//! Every background task in the transport (socket pumps, heartbeat
//! producers, reconnect loops) and every application-visible callback runs
//! through this provider. Because all tasks share one cooperative scheduler,
//! callbacks never overlap and observe a deterministic ordering - this is
//! the foreground executor the rest of the system is written against.

use async_trait::async_trait;
use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// The name is used for tracing only. The task is executed with
    /// `spawn_local` semantics to maintain single-threaded execution
    /// guarantees.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;

    /// Yield control to allow other tasks to run.
    async fn yield_now(&self);
}

/// Production task provider using Tokio's `spawn_local`.
///
/// Requires the caller to be running inside a `LocalSet` (or a
/// current-thread runtime that supports local tasks).
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

#[async_trait(?Send)]
impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!("task {} starting", task_name);
            future.await;
            tracing::trace!("task {} completed", task_name);
        })
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
