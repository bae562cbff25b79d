//! Fixed-capacity pool of browser page contexts.
//!
//! [`PagePool`] creates all of its pages up front and lends them out one
//! caller at a time. Blocking in [`PagePool::acquire`] is the only admission
//! control in the system: no render starts until a page is free.
//!
//! ## Ownership
//!
//! - An idle page lives in the pool's idle list.
//! - A lent page is a [`PageHandle`] owned by the borrower. The pool only keeps
//!   its id in the outstanding set.
//! - While the pool is open, `idle + outstanding == size`.
//!
//! Both sets change only under the pool lock. The lock is never held across an
//! `.await` or while the allocator destroys a page.

use crate::{BLANK_URL, Cancel, Error, PageAllocator, Result, ValidationError};
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A page lent out by a [`PagePool`].
///
/// Handles are not `Clone`; hand them back with [`PagePool::release`].
pub struct PageHandle<P> {
    id: u64,
    pool_id: u64,
    page: P,
}

impl<P> PageHandle<P> {
    /// Process-unique id of this page.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn page(&self) -> &P {
        &self.page
    }
}

impl<P> Deref for PageHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.page
    }
}

impl<P> fmt::Debug for PageHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .finish_non_exhaustive()
    }
}

struct PoolState<P> {
    idle: Vec<PageHandle<P>>,
    outstanding: HashSet<u64>,
    closed: bool,
}

pub struct PagePool<A: PageAllocator> {
    id: u64,
    size: usize,
    allocator: A,
    state: Mutex<PoolState<A::Page>>,
    available: Notify,
}

impl<A: PageAllocator> PagePool<A> {
    /// Creates a pool of `size` pages, opening every page before returning.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidSize`] if `size` is zero.
    /// - Whatever [`PageAllocator::create`] reports. Pages opened before the
    ///   failure are destroyed.
    pub async fn new(size: usize, allocator: A) -> Result<Self> {
        if size == 0 {
            return Err(ValidationError::InvalidSize.into());
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            match allocator.create().await {
                Ok(page) => idle.push(PageHandle {
                    id: NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed),
                    pool_id: id,
                    page,
                }),
                Err(e) => {
                    tracing::error!("Failed to open page {} of {size}: {e}", idle.len() + 1);
                    for handle in idle {
                        allocator.destroy(handle.page);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!("Page pool {id} opened {size} pages");

        Ok(Self {
            id,
            size,
            allocator,
            state: Mutex::new(PoolState {
                idle,
                outstanding: HashSet::with_capacity(size),
                closed: false,
            }),
            available: Notify::new(),
        })
    }

    /// Waits for an idle page, points it at `initial_url` and lends it out.
    ///
    /// A failed initial navigation is logged; the page is still returned so
    /// the renderer can navigate it itself.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is closed, now or while waiting.
    /// - [`Error::Cancelled`] or [`Error::DeadlineExceeded`] once `cancel`
    ///   fires.
    pub async fn acquire(
        &self,
        cancel: &Cancel,
        initial_url: &str,
    ) -> Result<PageHandle<A::Page>> {
        let handle = loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(err) = cancel.error() {
                    return Err(err);
                }
                if let Some(handle) = state.idle.pop() {
                    state.outstanding.insert(handle.id);
                    break handle;
                }
            }

            tokio::select! {
                biased;
                err = cancel.done() => return Err(err),
                () = &mut notified => {}
            }
        };

        // Hand the page back if the caller drops us mid-navigation.
        let lease = PageLease::new(self, handle);
        if let Err(e) = self.allocator.navigate(lease.page(), initial_url).await {
            tracing::warn!("Page {} failed to open {initial_url}: {e}", lease.id());
        }

        Ok(lease.into_handle())
    }

    /// [`PagePool::acquire`] parked on `about:blank`.
    pub async fn acquire_blank(&self, cancel: &Cancel) -> Result<PageHandle<A::Page>> {
        self.acquire(cancel, BLANK_URL).await
    }

    /// Takes a lent page back.
    ///
    /// Once the pool is closed, returned pages are destroyed instead of going
    /// back to the idle list.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPage`] if the page belongs to another pool.
    /// - [`Error::DoubleRelease`] if the page is not currently lent out.
    ///
    /// In both cases the page is destroyed; its state can no longer be
    /// trusted.
    pub fn release(&self, handle: PageHandle<A::Page>) -> Result<()> {
        if handle.pool_id != self.id {
            tracing::warn!(
                "Page {} from pool {} released into pool {}",
                handle.id,
                handle.pool_id,
                self.id
            );
            self.allocator.destroy(handle.page);
            return Err(Error::InvalidPage);
        }

        let mut state = self.state.lock();
        if !state.outstanding.remove(&handle.id) {
            drop(state);
            tracing::warn!("Page {} released while not lent out", handle.id);
            self.allocator.destroy(handle.page);
            return Err(Error::DoubleRelease);
        }

        if state.closed {
            drop(state);
            tracing::debug!("Destroying page {} returned after close", handle.id);
            self.allocator.destroy(handle.page);
            return Ok(());
        }

        state.idle.push(handle);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Stops lending and destroys every idle page.
    ///
    /// Idempotent and non-blocking. Pages still lent out are destroyed as
    /// they are released. Waiters in [`PagePool::acquire`] wake up with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            core::mem::take(&mut state.idle)
        };

        tracing::info!(
            "Closing page pool {} ({} idle, {} lent out)",
            self.id,
            idle.len(),
            self.outstanding()
        );

        for handle in idle {
            self.allocator.destroy(handle.page);
        }
        self.available.notify_waiters();
    }

    /// Configured number of pages.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of idle pages right now.
    pub fn available(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of pages lent out right now.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub const fn allocator(&self) -> &A {
        &self.allocator
    }
}

/// A lent page that goes back to its pool when dropped.
///
/// Holding a page in a lease keeps it from leaking when the future using it
/// is dropped or aborted. Once the pool is closed, the return destroys it.
pub struct PageLease<'a, A: PageAllocator> {
    pool: &'a PagePool<A>,
    handle: ManuallyDrop<PageHandle<A::Page>>,
}

impl<'a, A: PageAllocator> PageLease<'a, A> {
    /// Ties `handle`, lent out by `pool`, to this lease.
    pub const fn new(pool: &'a PagePool<A>, handle: PageHandle<A::Page>) -> Self {
        Self {
            pool,
            handle: ManuallyDrop::new(handle),
        }
    }

    /// Disarms the lease and hands the page to the caller, who becomes
    /// responsible for releasing it.
    pub fn into_handle(self) -> PageHandle<A::Page> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the handle is moved out exactly
        // once and `Drop for PageLease` never sees it.
        unsafe { ManuallyDrop::take(&mut this.handle) }
    }

    /// Returns the page to its pool now. See [`PagePool::release`].
    pub fn release(self) -> Result<()> {
        let pool = self.pool;
        pool.release(self.into_handle())
    }
}

impl<A: PageAllocator> Deref for PageLease<'_, A> {
    type Target = PageHandle<A::Page>;

    fn deref(&self) -> &PageHandle<A::Page> {
        &self.handle
    }
}

impl<A: PageAllocator> Drop for PageLease<'_, A> {
    fn drop(&mut self) {
        // SAFETY: `drop` runs at most once and `into_handle` skips it, so the
        // handle is still in place and is not touched again.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        tracing::debug!("Page {} returned by a dropped lease", handle.id);
        let _ = self.pool.release(handle);
    }
}

impl<A: PageAllocator> fmt::Debug for PageLease<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLease")
            .field("pool_id", &self.pool.id)
            .field("handle", &*self.handle)
            .finish()
    }
}

impl<A: PageAllocator> Drop for PagePool<A> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<A: PageAllocator> fmt::Debug for PagePool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PagePool")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("idle", &state.idle.len())
            .field("outstanding", &state.outstanding.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubAllocator, StubPage};
    use core::time::Duration;
    use std::sync::Arc;

    async fn pool(size: usize) -> PagePool<StubAllocator> {
        PagePool::new(size, StubAllocator::default()).await.unwrap()
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let err = PagePool::new(0, StubAllocator::default()).await.unwrap_err();
        assert_eq!(err, Error::Validation(ValidationError::InvalidSize));
    }

    #[tokio::test]
    async fn failed_create_destroys_opened_pages() {
        let allocator = StubAllocator::failing_after(2);
        let stats = allocator.stats();
        let err = PagePool::new(4, allocator).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));
        assert_eq!(stats.created(), 2);
        assert_eq!(stats.destroyed(), 2);
    }

    #[tokio::test]
    async fn acquire_and_release_track_availability() {
        let pool = pool(2).await;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.available(), 2);

        let page = pool.acquire_blank(&Cancel::new()).await.unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(
            pool.allocator().stats().last_navigation(&page).as_deref(),
            Some(BLANK_URL)
        );

        pool.release(page).unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn acquire_navigates_to_initial_url() {
        let pool = pool(1).await;
        let page = pool
            .acquire(&Cancel::new(), "https://example.com/start")
            .await
            .unwrap();
        assert_eq!(
            pool.allocator().stats().last_navigation(&page).as_deref(),
            Some("https://example.com/start")
        );
        pool.release(page).unwrap();
    }

    #[tokio::test]
    async fn failed_initial_navigation_still_lends_the_page() {
        let pool = PagePool::new(1, StubAllocator::failing_navigation()).await.unwrap();
        let page = pool.acquire_blank(&Cancel::new()).await.unwrap();
        pool.release(page).unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let pool = pool(1).await;
        let page = pool.acquire_blank(&Cancel::new()).await.unwrap();

        let cancel = Cancel::new().with_timeout(Duration::from_millis(10));
        let err = pool.acquire_blank(&cancel).await.unwrap_err();
        assert_eq!(err, Error::DeadlineExceeded);

        pool.release(page).unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn acquire_with_cancelled_token_fails_immediately() {
        let pool = pool(1).await;
        let cancel = Cancel::new();
        cancel.cancel();
        assert_eq!(pool.acquire_blank(&cancel).await.unwrap_err(), Error::Cancelled);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn extra_acquire_blocks_until_release() {
        let pool = Arc::new(pool(2).await);
        let first = pool.acquire_blank(&Cancel::new()).await.unwrap();
        let second = pool.acquire_blank(&Cancel::new()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_blank(&Cancel::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.outstanding(), 2);

        pool.release(first).unwrap();
        let third = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter was not woken by release")
            .unwrap()
            .unwrap();
        assert_eq!(pool.outstanding(), 2);

        pool.release(second).unwrap();
        pool.release(third).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_lends_more_than_size() {
        let size = 3;
        let pool = Arc::new(pool(size).await);
        let stats = pool.allocator().stats();

        let borrowers: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let stats = stats.clone();
                tokio::spawn(async move {
                    for _ in 0..8 {
                        let page = pool.acquire_blank(&Cancel::new()).await.unwrap();
                        stats.enter();
                        tokio::task::yield_now().await;
                        stats.leave();
                        pool.release(page).unwrap();
                    }
                })
            })
            .collect();

        for borrower in borrowers {
            borrower.await.unwrap();
        }

        assert!(stats.peak_in_use() <= size);
        assert_eq!(pool.available(), size);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn release_of_page_not_lent_out_is_double_release() {
        let pool = pool(2).await;
        let page = pool.acquire_blank(&Cancel::new()).await.unwrap();
        let forged = PageHandle {
            id: page.id(),
            pool_id: page.pool_id,
            page: StubPage::new(page.serial()),
        };

        pool.release(page).unwrap();
        let destroyed = pool.allocator().stats().destroyed();

        assert_eq!(pool.release(forged).unwrap_err(), Error::DoubleRelease);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocator().stats().destroyed(), destroyed + 1);
    }

    #[tokio::test]
    async fn release_into_another_pool_is_invalid() {
        let a = pool(1).await;
        let b = pool(1).await;

        let page = a.acquire_blank(&Cancel::new()).await.unwrap();
        assert_eq!(b.release(page).unwrap_err(), Error::InvalidPage);
        assert_eq!(b.available(), 1);
        assert_eq!(b.allocator().stats().destroyed(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_destroys_idle_pages() {
        let pool = pool(3).await;
        let stats = pool.allocator().stats();
        let lent = pool.acquire_blank(&Cancel::new()).await.unwrap();

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.available(), 0);
        assert_eq!(stats.destroyed(), 2);

        assert_eq!(
            pool.acquire_blank(&Cancel::new()).await.unwrap_err(),
            Error::PoolClosed
        );

        pool.release(lent).unwrap();
        assert_eq!(stats.destroyed(), 3);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_wakes_waiters() {
        let pool = Arc::new(pool(1).await);
        let lent = pool.acquire_blank(&Cancel::new()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_blank(&Cancel::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();
        let err = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter was not woken by close")
            .unwrap()
            .unwrap_err();
        assert_eq!(err, Error::PoolClosed);

        pool.release(lent).unwrap();
    }

    #[tokio::test]
    async fn dropping_the_pool_destroys_its_pages() {
        let pool = pool(2).await;
        let stats = pool.allocator().stats();
        drop(pool);
        assert_eq!(stats.destroyed(), 2);
    }

    #[tokio::test]
    async fn dropped_lease_returns_the_page() {
        let pool = pool(1).await;
        let lease = PageLease::new(&pool, pool.acquire_blank(&Cancel::new()).await.unwrap());
        assert_eq!(pool.available(), 0);

        drop(lease);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn lease_into_handle_keeps_the_page_lent() {
        let pool = pool(1).await;
        let lease = PageLease::new(&pool, pool.acquire_blank(&Cancel::new()).await.unwrap());
        let id = lease.id();

        let page = lease.into_handle();
        assert_eq!(page.id(), id);
        assert_eq!(pool.outstanding(), 1);

        pool.release(page).unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn lease_dropped_after_close_destroys_the_page() {
        let pool = pool(1).await;
        let stats = pool.allocator().stats();
        let lease = PageLease::new(&pool, pool.acquire_blank(&Cancel::new()).await.unwrap());

        pool.close();
        drop(lease);
        assert_eq!(stats.destroyed(), stats.created());
        assert_eq!(pool.outstanding(), 0);
    }
}
