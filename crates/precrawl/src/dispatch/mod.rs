//! Worker pool that drains the task queue.
//!
//! ## Structure
//!
//! - [`manager`] - [`Dispatcher`]: spawns workers and coordinates shutdown.
//! - [`worker`] - the per-worker loop and the render step it runs per task.

mod manager;
mod worker;

pub use manager::Dispatcher;
pub use worker::{render_task, worker_loop};
