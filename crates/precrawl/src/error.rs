//! Error types for the prerendering core.
//!
//! This module defines the central [`Error`] enum shared by the page pool, the
//! task queue, the dispatcher and renderer implementations, along with
//! [`ValidationError`] for parameters rejected before any shared state is
//! touched.
//!
//! ## Error Cases
//! - `Validation`: bad construction or task parameters.
//! - `EmptyQueue`: a non-blocking dequeue or peek found nothing.
//! - `PoolClosed`: the page pool no longer lends pages.
//! - `DoubleRelease`: a page was returned that is not currently lent out.
//! - `InvalidPage`: a page from another pool was returned.
//! - `Cancelled` / `DeadlineExceeded`: a [`crate::Cancel`] fired.
//! - `Render`: the browser backend failed to navigate or extract HTML.
//! - `SelectorWaitTimeout`: soft failure, the HTML is still available.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the prerendering core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Parameters were rejected before entering the queue or the pool.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The queue had no task to hand out.
    #[error("task queue is empty")]
    EmptyQueue,

    /// The page pool has been closed.
    #[error("page pool is closed")]
    PoolClosed,

    /// The released page is not currently lent out by this pool.
    #[error("page returned more than once")]
    DoubleRelease,

    /// The released page was not minted by this pool.
    #[error("invalid page")]
    InvalidPage,

    /// The wait was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The wait outlived its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The browser backend failed.
    #[error("render failed: {0}")]
    Render(String),

    /// The selector never became visible. The page was still captured.
    #[error("timed out waiting for selector `{selector}`")]
    SelectorWaitTimeout { selector: String, html: String },
}

impl Error {
    /// Returns `true` for errors produced by a fired [`crate::Cancel`].
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// HTML captured alongside a soft failure, if any.
    pub fn html(&self) -> Option<&str> {
        match self {
            Self::SelectorWaitTimeout { html, .. } => Some(html),
            _ => None,
        }
    }
}

/// Reasons a pool or task was rejected up front.
#[derive(Clone, Copy, thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("page pool size must be positive")]
    InvalidSize,

    #[error("target url is empty")]
    EmptyUrl,

    #[error("query selector is empty")]
    EmptySelector,

    #[error("wait duration must be non-negative")]
    NegativeWait,

    #[error("selector wait timeout must be non-negative")]
    NegativeSelectorTimeout,
}
