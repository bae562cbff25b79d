#[cfg(feature = "chromium")]
pub mod chromium;
pub mod config;
pub mod gateway;
pub mod telemetry;
