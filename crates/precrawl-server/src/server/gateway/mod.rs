mod error;
mod handler;
mod overrides;

pub use handler::{Gateway, GatewaySettings};
