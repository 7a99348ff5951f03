//! Conditional request evaluation (`If-Match`, `If-None-Match`,
//! `If-Modified-Since`, `If-Unmodified-Since`).
//!
//! Preconditions are checked in this order, the first failure wins:
//!
//! 1. `If-Match` not matching the current entity tag fails with 412, or with
//!    416 when the request also carries a `Range` header.
//! 2. `If-Unmodified-Since` earlier than the modification time fails with 412.
//! 3. `If-None-Match` matching, or, when `If-None-Match` is absent,
//!    `If-Modified-Since` not earlier than the modification time, yields 304.
//!
//! A date header that does not parse never blocks the request.

use std::time::SystemTime;

use axum::http::header::{IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, RANGE};
use axum::http::{HeaderMap, HeaderName, StatusCode};

use crate::context::ResponseContext;

/// Validator headers of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestValidators {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_unmodified_since: Option<String>,
    /// Whether a `Range` header was sent; turns a failed `If-Match` into 416.
    pub has_range: bool,
}

impl RequestValidators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        RequestValidators {
            if_match: get(IF_MATCH),
            if_none_match: get(IF_NONE_MATCH),
            if_modified_since: get(IF_MODIFIED_SINCE),
            if_unmodified_since: get(IF_UNMODIFIED_SINCE),
            has_range: headers.contains_key(RANGE),
        }
    }
}

/// Result of evaluating the preconditions of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    NotModified,
    PreconditionFailed,
    /// `If-Match` failed on a range request.
    PreconditionFailedAsRange,
}

impl Outcome {
    /// Status to short-circuit with, `None` for [`Outcome::Continue`].
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Outcome::Continue => None,
            Outcome::NotModified => Some(StatusCode::NOT_MODIFIED),
            Outcome::PreconditionFailed => Some(StatusCode::PRECONDITION_FAILED),
            Outcome::PreconditionFailedAsRange => Some(StatusCode::RANGE_NOT_SATISFIABLE),
        }
    }
}

/// Decides whether the request continues. Does not touch the context.
pub fn evaluate(validators: &RequestValidators, ctx: &ResponseContext) -> Outcome {
    let etag = ctx.etag.as_deref();
    let modified = ctx.last_modified;

    if let Some(if_match) = &validators.if_match {
        if !etag_matches(if_match, etag) {
            return if validators.has_range {
                Outcome::PreconditionFailedAsRange
            } else {
                Outcome::PreconditionFailed
            };
        }
    }

    if let Some(since) = validators.if_unmodified_since.as_deref() {
        if is_before(since, modified) {
            return Outcome::PreconditionFailed;
        }
    }

    let not_modified = match (&validators.if_none_match, &validators.if_modified_since) {
        (Some(if_none_match), _) => etag_matches(if_none_match, etag),
        (None, Some(since)) => is_not_before(since, modified),
        (None, None) => false,
    };
    if not_modified {
        return Outcome::NotModified;
    }

    Outcome::Continue
}

/// `*` matches any current entity, otherwise the tag must appear in the list.
fn etag_matches(header: &str, etag: Option<&str>) -> bool {
    match etag {
        Some(etag) => header.trim() == "*" || header.contains(etag),
        None => false,
    }
}

/// Whether the date in `header` lies strictly before `modified`.
fn is_before(header: &str, modified: Option<SystemTime>) -> bool {
    match (httpdate::parse_http_date(header), modified) {
        (Ok(date), Some(modified)) => date < modified,
        _ => false,
    }
}

/// Whether the date in `header` is at or after `modified`.
pub(crate) fn is_not_before(header: &str, modified: Option<SystemTime>) -> bool {
    match (httpdate::parse_http_date(header), modified) {
        (Ok(date), Some(modified)) => date >= modified,
        _ => false,
    }
}
