#![doc = include_str!("../README.md")]

mod cancel;
mod dispatch;
mod error;
mod pool;
mod queue;
mod render;
mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::cancel::*;
pub use crate::dispatch::*;
pub use crate::error::*;
pub use crate::pool::*;
pub use crate::queue::*;
pub use crate::render::*;
pub use crate::task::*;
