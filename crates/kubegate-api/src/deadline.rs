//! Per-request deadlines

use std::time::Duration;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;

use crate::error::{ApiError, Error, Result};
use crate::server::AppState;

/// Header carrying the caller's budget in seconds
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Longest budget a caller may ask for
pub const MAX_DEADLINE: Duration = Duration::from_secs(600);

/// Time budget for one client-facing call
///
/// Taken from `X-Request-Timeout`, then `timeout_seconds`, then the
/// configured default. For stream bridges only an explicit value counts, and
/// it bounds the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    budget: Duration,
    explicit: bool,
}

impl Deadline {
    /// A deadline of `budget`, as if the caller had not asked for one
    pub fn default_of(budget: Duration) -> Self {
        Self {
            budget,
            explicit: false,
        }
    }

    /// The time budget
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// The budget, only if the caller supplied it
    pub fn explicit(&self) -> Option<Duration> {
        self.explicit.then_some(self.budget)
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeadlineQuery {
    timeout_seconds: Option<String>,
}

fn parse_seconds(raw: &str, source: &str) -> Result<Duration> {
    let seconds: u64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::validation_for_field(source, format!("invalid timeout {:?}", raw)))?;
    if seconds == 0 {
        return Err(Error::validation_for_field(source, "timeout must be positive"));
    }
    Ok(Duration::from_secs(seconds).min(MAX_DEADLINE))
}

/// Resolve a deadline from the header value, the query value and the default
pub fn resolve(header: Option<&str>, query: Option<&str>, default: Duration) -> Result<Deadline> {
    if let Some(raw) = header {
        return Ok(Deadline {
            budget: parse_seconds(raw, REQUEST_TIMEOUT_HEADER)?,
            explicit: true,
        });
    }
    if let Some(raw) = query {
        return Ok(Deadline {
            budget: parse_seconds(raw, "timeout_seconds")?,
            explicit: true,
        });
    }
    Ok(Deadline::default_of(default))
}

impl FromRequestParts<AppState> for Deadline {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(REQUEST_TIMEOUT_HEADER)
            .map(|v| {
                v.to_str()
                    .map_err(|_| Error::validation_for_field(REQUEST_TIMEOUT_HEADER, "not ASCII"))
            })
            .transpose()?;
        let query = Query::<DeadlineQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        Ok(resolve(
            header,
            query.timeout_seconds.as_deref(),
            state.config.request_timeout,
        )?)
    }
}
