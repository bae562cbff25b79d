//! Unbounded FIFO of render tasks with a cancellable blocking dequeue.
//!
//! The queue is a [`VecDeque`] behind a [`parking_lot::Mutex`]. Producers push
//! under the lock and wake one waiter through a [`Notify`]. Consumers that find
//! the queue empty race that notification against their [`Cancel`] handle, so
//! a cancelled consumer returns promptly even if no task ever arrives.

use crate::{Cancel, Error, RenderParams, Result, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct TaskQueue {
    items: Mutex<VecDeque<Task>>,
    not_empty: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `task` and appends it to the tail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] with the first violated rule. Rejected
    /// tasks never enter the queue.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        task.params().validate()?;

        self.items.lock().push_back(task);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns the head without waiting.
    pub fn dequeue(&self) -> Result<Task> {
        self.items.lock().pop_front().ok_or(Error::EmptyQueue)
    }

    /// Removes and returns the head, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] or [`Error::DeadlineExceeded`] once
    /// `cancel` fires. A queued task is never lost to a cancelled waiter.
    pub async fn wait_dequeue(&self, cancel: &Cancel) -> Result<Task> {
        loop {
            // Register interest before checking so an enqueue landing between
            // the check and the await still wakes us.
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.items.lock().pop_front() {
                return Ok(task);
            }
            if let Some(err) = cancel.error() {
                return Err(err);
            }

            tokio::select! {
                biased;
                err = cancel.done() => return Err(err),
                () = &mut notified => {}
            }
        }
    }

    /// Parameters of the head task, leaving it in place.
    pub fn peek(&self) -> Result<RenderParams> {
        self.items
            .lock()
            .front()
            .map(|task| task.params().clone())
            .ok_or(Error::EmptyQueue)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
