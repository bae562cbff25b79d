//! Fixed-size pool of render workers.
//!
//! This module defines [`Dispatcher`], which spawns one [`worker_loop`] per
//! worker on the current Tokio runtime. All workers pull from the same
//! [`TaskQueue`], borrow from the same [`PagePool`] and share a single
//! [`CancellationToken`] used for coordinated shutdown.

use super::worker::worker_loop;
use crate::{Cancel, PageAllocator, PagePool, Renderer, TaskQueue};
use core::time::Duration;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub struct Dispatcher {
    workers: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl Dispatcher {
    /// Spawns `num_workers` workers with a fresh shutdown token.
    pub fn spawn<A, R>(
        num_workers: usize,
        queue: Arc<TaskQueue>,
        pool: Arc<PagePool<A>>,
        renderer: Arc<R>,
    ) -> Self
    where
        A: PageAllocator,
        R: Renderer<A::Page>,
    {
        Self::spawn_with_token(num_workers, queue, pool, renderer, CancellationToken::new())
    }

    /// Spawns `num_workers` workers that stop once `shutdown_token` (or its
    /// parent) is cancelled.
    pub fn spawn_with_token<A, R>(
        num_workers: usize,
        queue: Arc<TaskQueue>,
        pool: Arc<PagePool<A>>,
        renderer: Arc<R>,
        shutdown_token: CancellationToken,
    ) -> Self
    where
        A: PageAllocator,
        R: Renderer<A::Page>,
    {
        let workers = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&pool),
                    Arc::clone(&renderer),
                    Cancel::from_token(shutdown_token.clone()),
                ))
            })
            .collect();

        tracing::info!("Dispatcher started {num_workers} workers");

        Self {
            workers,
            shutdown_token,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Token shared by every worker. Cancelling it stops them once their
    /// current task is done.
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Stops every worker and waits for them to exit.
    ///
    /// - Cancels the shared token. Idle workers return immediately.
    /// - Waits up to `grace` so in-flight renders can finish and post their
    ///   results.
    /// - Aborts workers that are still running after that and waits for them
    ///   to unwind, so their pages are back in the pool on return.
    ///
    /// Returns the number of workers that had to be aborted.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        tracing::debug!("Cancelling workers via shutdown token");
        self.shutdown_token.cancel();

        let workers = core::mem::take(&mut self.workers);
        let joins = workers.into_iter().enumerate().map(|(i, mut handle)| async move {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::trace!("Worker {i} shutdown acknowledged");
                    false
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker {i} terminated abnormally: {e}");
                    false
                }
                Err(_) => {
                    tracing::warn!("Worker {i} shutdown timed out, aborting");
                    handle.abort();
                    // Resolves once the task is dropped and its page is back.
                    let _ = handle.await;
                    true
                }
            }
        });

        let aborted = join_all(joins)
            .await
            .into_iter()
            .filter(|aborted| *aborted)
            .count();

        tracing::info!("Dispatcher shutdown complete");
        aborted
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
