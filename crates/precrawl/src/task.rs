//! Render tasks and their single-slot result channel.

use crate::{Error, ValidationError};
use core::fmt;
use core::time::Duration;
use tokio::sync::oneshot;

/// Selector awaited when a request does not name one.
pub const DEFAULT_SELECTOR: &str = "body";

/// Outcome of rendering one task.
///
/// A soft selector timeout is reported as [`Error::SelectorWaitTimeout`],
/// which still carries the captured HTML.
pub type RenderResult = Result<String, Error>;

/// Everything a renderer needs to produce one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderParams {
    /// Absolute URL to navigate to.
    pub target_url: String,
    /// Settle delay after navigation and after the selector shows up.
    pub wait: Duration,
    /// CSS selector that must become visible before the HTML is captured.
    pub selector: String,
    /// Upper bound on the selector wait. Zero waits indefinitely.
    pub selector_timeout: Duration,
}

impl RenderParams {
    /// Parameters for `target_url` with the default selector and no waits.
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            wait: Duration::ZERO,
            selector: DEFAULT_SELECTOR.to_owned(),
            selector_timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }

    #[must_use]
    pub const fn with_selector_timeout(mut self, timeout: Duration) -> Self {
        self.selector_timeout = timeout;
        self
    }

    /// Returns the first rule these parameters break.
    ///
    /// Durations cannot be negative here; signed inputs are checked where
    /// they are parsed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target_url.trim().is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        if self.selector.trim().is_empty() {
            return Err(ValidationError::EmptySelector);
        }
        Ok(())
    }
}

/// A queued render request paired with the channel its result goes to.
///
/// The channel holds exactly one value and never blocks the sender, so a
/// worker can always post a result even after the requester gave up.
pub struct Task {
    params: RenderParams,
    result_tx: oneshot::Sender<RenderResult>,
}

impl Task {
    /// Creates a task and the receiver its result will arrive on.
    pub fn new(params: RenderParams) -> (Self, oneshot::Receiver<RenderResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        (Self { params, result_tx }, result_rx)
    }

    pub const fn params(&self) -> &RenderParams {
        &self.params
    }

    /// Returns `true` if the requester stopped listening.
    pub fn is_abandoned(&self) -> bool {
        self.result_tx.is_closed()
    }

    /// Posts the result and closes the channel.
    ///
    /// Returns `false` if nobody was listening any more. The result is dropped
    /// in that case.
    pub fn complete(self, result: RenderResult) -> bool {
        self.result_tx.send(result).is_ok()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("params", &self.params)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}
