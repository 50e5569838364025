use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;

use super::{Request, Response};
use crate::Error;

/// Decides whether a response asks for a delayed retry, and for how long.
#[derive(Debug, Clone)]
pub struct RetryAfterHandler {
    retry_limit: u32,
    max_sleep: Duration,
}

impl RetryAfterHandler {
    /// Retry at most `retry_limit` times, never sleeping longer than `max_sleep`.
    pub fn new(retry_limit: u32, max_sleep: Duration) -> Self {
        Self {
            retry_limit,
            max_sleep,
        }
    }

    /// The configured retry limit.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// The longest delay ever returned.
    pub fn max_sleep(&self) -> Duration {
        self.max_sleep
    }

    /// 429 and 503 responses may carry `Retry-After`.
    pub fn is_retry_after(&self, response: &Response) -> bool {
        matches!(response.code(), 429 | 503)
    }

    /// How long to wait before retrying `request`, given `retries` have already been made.
    ///
    /// Returns `None` when the response carries no `Retry-After` header.
    pub fn retry_after_interval(
        &self,
        request: &Request,
        response: &Response,
        retries: u32,
    ) -> Result<Option<Duration>, Error> {
        if retries >= self.retry_limit {
            return Err(Error::TooManyRetryAfters {
                addr: request.origin().clone(),
            });
        }

        let Some(value) = response.headers().get(RETRY_AFTER) else {
            return Ok(None);
        };

        let text = String::from_utf8_lossy(value.as_bytes());
        let seconds = parse_retry_after(text.trim(), Utc::now()).ok_or_else(|| {
            Error::Protocol(format!(
                "Failed to parse Retry-After header '{text}' as an integer or RFC 2822 date"
            ))
        })?;

        Ok(Some(Duration::from_secs(seconds).min(self.max_sleep)))
    }
}

/// Seconds to wait: either a non-negative integer, or an RFC 2822 date
/// relative to `now` (clamped at zero).
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let seconds = (date.with_timezone(&Utc) - now).num_seconds().max(0);
    u64::try_from(seconds).ok()
}
