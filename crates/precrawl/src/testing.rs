//! In-memory stand-ins for the browser backend.
//!
//! Available to this crate's tests and, through the `testing` feature, to
//! downstream crates that want to exercise the pool and dispatcher without a
//! browser.

use crate::{Error, PageAllocator, RenderParams, Renderer, Result};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page produced by [`StubAllocator`].
#[derive(Debug, PartialEq, Eq)]
pub struct StubPage {
    serial: usize,
}

impl StubPage {
    pub const fn new(serial: usize) -> Self {
        Self { serial }
    }

    pub const fn serial(&self) -> usize {
        self.serial
    }
}

/// Counters shared between a [`StubAllocator`] and the test observing it.
#[derive(Debug, Default)]
pub struct StubStats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    navigations: Mutex<HashMap<usize, String>>,
}

impl StubStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Last URL `page` was navigated to.
    pub fn last_navigation(&self, page: &StubPage) -> Option<String> {
        self.navigations.lock().get(&page.serial).cloned()
    }

    /// Marks the start of a section that holds a page.
    pub fn enter(&self) {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    /// Most pages ever held at once between [`StubStats::enter`] and
    /// [`StubStats::leave`].
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct StubAllocator {
    stats: Arc<StubStats>,
    fail_after: Option<usize>,
    fail_navigation: bool,
}

impl StubAllocator {
    /// Succeeds `n` times, then fails every [`PageAllocator::create`].
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    /// Fails every [`PageAllocator::navigate`].
    pub fn failing_navigation() -> Self {
        Self {
            fail_navigation: true,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> Arc<StubStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl PageAllocator for StubAllocator {
    type Page = StubPage;

    async fn create(&self) -> Result<StubPage> {
        let created = self.stats.created();
        if self.fail_after.is_some_and(|n| created >= n) {
            return Err(Error::Render("browser refused a new tab".into()));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(StubPage::new(created))
    }

    async fn navigate(&self, page: &StubPage, url: &str) -> Result<()> {
        if self.fail_navigation {
            return Err(Error::Render(format!("cannot open {url}")));
        }
        self.stats
            .navigations
            .lock()
            .insert(page.serial, url.to_owned());
        Ok(())
    }

    fn destroy(&self, _page: StubPage) {
        self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a [`StubRenderer`] answers with.
#[derive(Clone, Debug)]
pub enum StubOutcome {
    Html(String),
    Fail(String),
    SelectorTimeout(String),
}

/// Renderer that records its calls and answers with a fixed outcome after an
/// optional delay.
#[derive(Debug)]
pub struct StubRenderer {
    outcome: StubOutcome,
    delay: Duration,
    calls: Mutex<Vec<RenderParams>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StubRenderer {
    pub fn html(html: impl Into<String>) -> Self {
        Self::new(StubOutcome::Html(html.into()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(StubOutcome::Fail(message.into()))
    }

    pub fn selector_timeout(html: impl Into<String>) -> Self {
        Self::new(StubOutcome::SelectorTimeout(html.into()))
    }

    pub const fn new(outcome: StubOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Parameters of every render so far, in call order.
    pub fn calls(&self) -> Vec<RenderParams> {
        self.calls.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer<StubPage> for StubRenderer {
    async fn render(&self, _page: &StubPage, params: &RenderParams) -> Result<String> {
        self.calls.lock().push(params.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.outcome {
            StubOutcome::Html(html) => Ok(html.clone()),
            StubOutcome::Fail(message) => Err(Error::Render(message.clone())),
            StubOutcome::SelectorTimeout(html) => Err(Error::SelectorWaitTimeout {
                selector: params.selector.clone(),
                html: html.clone(),
            }),
        }
    }
}
