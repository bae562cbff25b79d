use crate::{
    Cancel, PageAllocator, PageLease, PagePool, RenderParams, RenderResult, Renderer, TaskQueue,
};
use std::sync::Arc;
use std::time::Instant;

/// Worker task that turns queued [`crate::Task`]s into rendered HTML.
///
/// Each iteration waits for a task, borrows a page, renders, hands the page
/// back and posts the result. The loop ends when `shutdown` fires while it is
/// waiting for work; a task already dequeued always runs to completion.
///
/// # Arguments
///
/// - `worker_id`: Identifier used in logs.
/// - `queue`: Shared task queue.
/// - `pool`: Shared page pool.
/// - `renderer`: Backend that drives a page through one render.
/// - `shutdown`: Fires when the dispatcher stops.
pub async fn worker_loop<A, R>(
    worker_id: usize,
    queue: Arc<TaskQueue>,
    pool: Arc<PagePool<A>>,
    renderer: Arc<R>,
    shutdown: Cancel,
) where
    A: PageAllocator,
    R: Renderer<A::Page>,
{
    tracing::debug!("Worker {worker_id} started");

    loop {
        let task = match queue.wait_dequeue(&shutdown).await {
            Ok(task) => task,
            Err(e) if e.is_cancellation() => {
                tracing::debug!("Worker {worker_id} received shutdown signal: {e}");
                break;
            }
            Err(e) => {
                tracing::warn!("Worker {worker_id} dequeue error: {e}");
                continue;
            }
        };

        let start = Instant::now();
        let result = render_task(&pool, renderer.as_ref(), task.params()).await;
        let target = &task.params().target_url;

        match &result {
            Ok(html) => tracing::info!(
                "Worker {worker_id} render ok target={target} bytes={} duration={:?}",
                html.len(),
                start.elapsed()
            ),
            Err(e) => tracing::warn!(
                "Worker {worker_id} render failed target={target} err={e} duration={:?}",
                start.elapsed()
            ),
        }

        if !task.complete(result) {
            tracing::debug!("Worker {worker_id} result dropped, requester went away");
        }
    }

    tracing::debug!("Worker {worker_id} stopped");
}

/// Renders `params` on a page borrowed from `pool`.
///
/// The page is acquired blank and released before this returns, or when the
/// future is dropped mid-render. If the render succeeded but the release did
/// not, the release error is the result.
///
/// The acquire is not cancellable: a task that left the queue is rendered
/// even while the dispatcher shuts down. It still fails fast with
/// [`crate::Error::PoolClosed`] once the pool is closed.
pub async fn render_task<A, R>(
    pool: &PagePool<A>,
    renderer: &R,
    params: &RenderParams,
) -> RenderResult
where
    A: PageAllocator,
    R: Renderer<A::Page>,
{
    // Leased so an aborted worker still returns the page.
    let lease = PageLease::new(pool, pool.acquire_blank(&Cancel::never()).await?);
    let page_id = lease.id();

    let rendered = renderer.render(lease.page(), params).await;
    let released = lease.release();

    match (rendered, released) {
        (Ok(_), Err(e)) => {
            tracing::warn!("Page {page_id} release failed after render: {e}");
            Err(e)
        }
        (Err(e), Err(release_err)) => {
            tracing::warn!("Page {page_id} release failed after render error: {release_err}");
            Err(e)
        }
        (rendered, Ok(())) => rendered,
    }
}
