//! Cancellation handle with an optional deadline.
//!
//! Every blocking wait in this crate takes a [`Cancel`]. It wraps a
//! [`CancellationToken`] so shutdown can fan out through child tokens, and
//! adds a deadline so callers can bound a wait without wrapping it in
//! `tokio::time::timeout` and losing the distinction between "cancelled" and
//! "ran out of time".

use crate::Error;
use core::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct Cancel {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A fresh handle with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle nobody else holds a reference to, so it only fires if the
    /// caller cancels it.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a child that also fires once `timeout` has elapsed.
    ///
    /// The child keeps the parent's deadline if that one is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Derives a child that fires with the parent but can be cancelled on its
    /// own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// The error a wait observing this handle would report right now.
    pub fn error(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the token is cancelled or the deadline passes.
    ///
    /// Cancel safe: dropping the future has no side effects.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Error::Cancelled,
                    () = sleep_until(deadline) => Error::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

impl From<CancellationToken> for Cancel {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}
