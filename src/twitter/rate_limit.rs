// Rate-limit bookkeeping for the X API
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;

pub const RESET_HEADER: &str = "x-rate-limit-reset";

/// Fallback wait when a 429 carries no reset header
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EndpointLimit {
    pub limit: i64,
    pub remaining: i64,
    /// Unix seconds at which the window resets
    pub reset: i64,
}

/// Resource family of an endpoint: `/media/upload` -> `media`
pub fn resource_of(endpoint: &str) -> Option<&str> {
    endpoint.split('/').nth(1).filter(|s| !s.is_empty())
}

/// Look up `resources[<family>][<endpoint>]` in a rate_limit_status reply
pub fn endpoint_limit(status: &serde_json::Value, endpoint: &str) -> Option<EndpointLimit> {
    let resource = resource_of(endpoint)?;
    let entry = status.get("resources")?.get(resource)?.get(endpoint)?;
    serde_json::from_value(entry.clone()).ok()
}

/// How long to wait before calling, if the window is within `buffer` of empty
pub fn wait_needed(limit: &EndpointLimit, now_unix: i64, buffer: i64) -> Option<Duration> {
    if limit.remaining > buffer {
        return None;
    }
    let secs = limit.reset - now_unix;
    if secs > 0 {
        Some(Duration::from_secs(secs as u64))
    } else {
        None
    }
}

/// Seconds until the window named by the reset header reopens
pub fn retry_after_from_headers(headers: &HeaderMap, now_unix: i64) -> u64 {
    headers
        .get(RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| (reset - now_unix).max(0) as u64)
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}
