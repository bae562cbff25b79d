//! HTTP-facing failures of the render gateway.
//!
//! [`GatewayError`] is what a request handler can fail with. Its
//! [`IntoResponse`] impl decides the status code:
//!
//! - `MethodNotAllowed` → `405` with `Allow: GET`.
//! - `InvalidWait` / `InvalidSelector` / `Rejected` → `400`, nothing is
//!   dispatched.
//! - `Render` → `500` with the renderer's message.
//! - `Canceled` → `408`.
//! - `Unavailable` → `503`, the worker stopped before answering.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("method not allowed")]
    MethodNotAllowed,

    /// A wait header could not be parsed.
    #[error("invalid wait: {0}")]
    InvalidWait(String),

    /// The selector header is not valid UTF-8.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// The task was refused before reaching a worker.
    #[error("{0}")]
    Rejected(precrawl::Error),

    /// The worker ran the task and it failed.
    #[error("{0}")]
    Render(precrawl::Error),

    /// The request was cancelled or ran out of time.
    #[error("request canceled")]
    Canceled,

    #[error("render worker stopped before answering")]
    Unavailable,
}

impl GatewayError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidWait(_) | Self::InvalidSelector(_) | Self::Rejected(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Canceled => StatusCode::REQUEST_TIMEOUT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<precrawl::ValidationError> for GatewayError {
    fn from(err: precrawl::ValidationError) -> Self {
        Self::Rejected(err.into())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if self == Self::MethodNotAllowed {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET"));
        }
        response
    }
}
