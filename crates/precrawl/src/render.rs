//! Seams to the browser backend.
//!
//! The core never talks to a browser directly. A backend supplies a
//! [`PageAllocator`] that owns the lifecycle of tab contexts and a
//! [`Renderer`] that drives one tab through a render.

use crate::{RenderParams, Result};
use async_trait::async_trait;

/// URL every page is parked on between renders.
pub const BLANK_URL: &str = "about:blank";

/// Creates, navigates and destroys the page contexts held by a
/// [`crate::PagePool`].
#[async_trait]
pub trait PageAllocator: Send + Sync + 'static {
    type Page: Send + Sync + 'static;

    /// Opens a new page context.
    async fn create(&self) -> Result<Self::Page>;

    /// Points `page` at `url`.
    async fn navigate(&self, page: &Self::Page, url: &str) -> Result<()>;

    /// Tears `page` down.
    ///
    /// Called with pool state unlocked but from synchronous code, so it must
    /// not block. Backends with asynchronous teardown should spawn it.
    fn destroy(&self, page: Self::Page);
}

/// Produces the HTML of one page.
#[async_trait]
pub trait Renderer<P>: Send + Sync + 'static {
    /// Navigates `page` to `params.target_url`, waits for `params.selector`
    /// and the settle delay, and returns the document's HTML.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Render`] if navigation or extraction failed.
    /// - [`crate::Error::SelectorWaitTimeout`] if the selector never became
    ///   visible. The HTML captured at that point rides along in the error.
    async fn render(&self, page: &P, params: &RenderParams) -> Result<String>;
}
