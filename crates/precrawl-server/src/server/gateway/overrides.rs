//! Per-request render overrides carried in headers.

use super::error::GatewayError;
use axum::http::HeaderMap;
use core::time::Duration;
use precrawl::ValidationError;

/// CSS selector to wait for instead of the configured default.
pub const SELECTOR_HEADER: &str = "x-render-selector";
/// Settle delay as a duration string (`300ms`, `2s`, `1m 30s`).
pub const WAIT_HEADER: &str = "x-render-wait";
/// Settle delay in whole milliseconds.
pub const WAIT_MS_HEADER: &str = "x-render-wait-ms";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, GatewayError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| GatewayError::InvalidWait(format!("{name} is not valid ASCII")))?
        .trim();
    Ok((!value.is_empty()).then_some(value))
}

/// Trimmed `X-Render-Selector`, or `None` when absent or blank.
///
/// Any UTF-8 selector is accepted, so `[title="café"]` works. Bytes that are
/// not UTF-8 are rejected instead of falling back to the default.
pub fn selector_override(headers: &HeaderMap) -> Result<Option<String>, GatewayError> {
    let Some(value) = headers.get(SELECTOR_HEADER) else {
        return Ok(None);
    };
    let selector = core::str::from_utf8(value.as_bytes())
        .map_err(|e| GatewayError::InvalidSelector(format!("{SELECTOR_HEADER}: {e}")))?
        .trim();
    Ok((!selector.is_empty()).then(|| selector.to_owned()))
}

/// Settle delay requested by the client, if any.
///
/// `X-Render-Wait` wins over `X-Render-Wait-Ms`. Negative values are
/// rejected with [`ValidationError::NegativeWait`].
pub fn wait_override(headers: &HeaderMap) -> Result<Option<Duration>, GatewayError> {
    if let Some(raw) = header_str(headers, WAIT_HEADER)? {
        return parse_wait(raw).map(Some);
    }

    if let Some(raw) = header_str(headers, WAIT_MS_HEADER)? {
        let millis: i64 = raw
            .parse()
            .map_err(|e| GatewayError::InvalidWait(format!("`{raw}`: {e}")))?;
        let millis = u64::try_from(millis).map_err(|_| ValidationError::NegativeWait)?;
        return Ok(Some(Duration::from_millis(millis)));
    }

    Ok(None)
}

fn parse_wait(raw: &str) -> Result<Duration, GatewayError> {
    if raw.starts_with('-') {
        return Err(ValidationError::NegativeWait.into());
    }
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw).map_err(|e| GatewayError::InvalidWait(format!("`{raw}`: {e}")))
}
