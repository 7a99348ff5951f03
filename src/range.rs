//! `Range` and `If-Range` handling.
//!
//! A `Range` header is turned into a list of inclusive [`ByteWindow`]s against
//! the size of the resource, once per request:
//!
//! ```text
//! bytes=500-999      offsets 500 to 999
//! bytes=9500-        offset 9500 to the end
//! bytes=-500         the final 500 bytes, or the whole resource if shorter
//! bytes=0-0,-1       first and last byte, served as multipart/byteranges
//! ```
//!
//! A last-byte-pos past the end is clamped to the last byte. Overlapping and
//! adjacent windows are merged and sorted by start offset. Syntax errors make
//! the whole header [`RangeDecision::Invalid`], which is served like a request
//! without `Range`. When no window starts inside the resource the request is
//! [`RangeDecision::Unsatisfiable`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use axum_extra::headers::ContentRange;

use crate::conditional::is_not_before;
use crate::context::ResponseContext;

/// An inclusive range of byte offsets, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        ByteWindow { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` for this window of a resource of `total_size` bytes.
    pub fn content_range(&self, total_size: u64) -> ContentRange {
        ContentRange::bytes(self.start..=self.end, total_size)
            .expect("ContentRange::bytes cannot panic in this usage")
    }
}

/// What to serve for a request, as decided by [`plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum RangeDecision {
    /// No `Range` header, or `If-Range` did not match.
    NotRequested,
    /// Malformed `Range` header, served as if absent.
    Invalid,
    /// No window starts inside the resource. Carries the resource size.
    Unsatisfiable(u64),
    Single(ByteWindow),
    Multi(Multipart),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseRangeError {
    Invalid,
    Unsatisfiable,
}

/// Parses a `Range` header value into merged windows against `size`.
pub(crate) fn parse_range_header(header: &str, size: u64) -> Result<Vec<ByteWindow>, ParseRangeError> {
    let (unit, set) = header.trim().split_once('=').ok_or(ParseRangeError::Invalid)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(ParseRangeError::Invalid);
    }

    let mut windows = Vec::new();
    let mut specs = 0;
    for spec in set.split(',').map(str::trim).filter(|spec| !spec.is_empty()) {
        specs += 1;
        let (first, last) = spec.split_once('-').ok_or(ParseRangeError::Invalid)?;
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            let suffix = parse_pos(last)?;
            // a zero suffix or an empty resource selects nothing
            if suffix > 0 && size > 0 {
                windows.push(ByteWindow::new(size.saturating_sub(suffix), size - 1));
            }
            continue;
        }

        let start = parse_pos(first)?;
        let end = match last {
            "" => None,
            last => Some(parse_pos(last)?),
        };
        if end.is_some_and(|end| end < start) {
            return Err(ParseRangeError::Invalid);
        }
        if start < size {
            let end = end.map_or(size - 1, |end| end.min(size - 1));
            windows.push(ByteWindow::new(start, end));
        }
    }

    if specs == 0 {
        return Err(ParseRangeError::Invalid);
    }
    if windows.is_empty() {
        return Err(ParseRangeError::Unsatisfiable);
    }
    Ok(merge(windows))
}

fn parse_pos(digits: &str) -> Result<u64, ParseRangeError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseRangeError::Invalid);
    }
    digits.parse().map_err(|_| ParseRangeError::Invalid)
}

/// Sorts by start offset and merges overlapping or adjacent windows.
fn merge(mut windows: Vec<ByteWindow>) -> Vec<ByteWindow> {
    windows.sort_by_key(|w| w.start);
    let mut merged: Vec<ByteWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(last) if window.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(window.end);
            }
            _ => merged.push(window),
        }
    }
    merged
}

/// Whether an `If-Range` validator still describes the current representation.
fn if_range_matches(header: &str, ctx: &ResponseContext) -> bool {
    if let Some(etag) = ctx.etag.as_deref() {
        if header.contains(etag) {
            return true;
        }
    }
    is_not_before(header, ctx.last_modified)
}

/// Decides which byte windows to serve and records the decision on `ctx`.
///
/// `Accept-Ranges` is always announced. On [`RangeDecision::Single`] and
/// [`RangeDecision::Multi`] the status becomes 206 and `Content-Range` or the
/// multipart content type is set, with `Content-Length` recomputed to the
/// exact number of bytes that will be sent.
pub fn plan(range: Option<&str>, if_range: Option<&str>, ctx: &mut ResponseContext) -> RangeDecision {
    ctx.accept_ranges = true;

    let Some(range) = range else {
        return RangeDecision::NotRequested;
    };
    if let Some(if_range) = if_range {
        if !if_range_matches(if_range, ctx) {
            tracing::debug!(if_range, "If-Range does not match, ignoring Range");
            return RangeDecision::NotRequested;
        }
    }

    let size = ctx.resource_size;
    let decision = match parse_range_header(range, size) {
        Err(ParseRangeError::Invalid) => RangeDecision::Invalid,
        Err(ParseRangeError::Unsatisfiable) => RangeDecision::Unsatisfiable(size),
        Ok(mut windows) if windows.len() == 1 => {
            let window = windows.remove(0);
            ctx.status = StatusCode::PARTIAL_CONTENT;
            ctx.content_range = Some(window.content_range(size));
            ctx.content_length = Some(window.len());
            RangeDecision::Single(window)
        }
        Ok(windows) => {
            let multipart = Multipart::new(windows, ctx.content_type.clone(), size);
            ctx.status = StatusCode::PARTIAL_CONTENT;
            ctx.content_type = multipart.content_type();
            ctx.content_length = Some(multipart.content_length());
            RangeDecision::Multi(multipart)
        }
    };
    tracing::debug!(range, ?decision, "range planned");
    decision
}

/// Layout of a `multipart/byteranges` body.
///
/// Every part is framed by [`Multipart::part_header`] and the body ends with
/// [`Multipart::closing`], so the length of the whole body is known before any
/// of it is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    windows: Vec<ByteWindow>,
    boundary: String,
    part_type: String,
    total_size: u64,
}

impl Multipart {
    /// `part_type` is the media type of the resource, repeated in every part.
    pub fn new(windows: Vec<ByteWindow>, part_type: String, total_size: u64) -> Self {
        Multipart::with_boundary(windows, part_type, total_size, generate_boundary())
    }

    pub fn with_boundary(windows: Vec<ByteWindow>, part_type: String, total_size: u64, boundary: String) -> Self {
        Multipart { windows, boundary, part_type, total_size }
    }

    pub fn windows(&self) -> &[ByteWindow] {
        &self.windows
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` of the whole response.
    pub fn content_type(&self) -> String {
        format!("multipart/byteranges; boundary={}", self.boundary)
    }

    /// Delimiter and headers preceding the bytes of `window`.
    pub fn part_header(&self, window: &ByteWindow) -> String {
        format!(
            "\r\n--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
            self.boundary, self.part_type, window.start, window.end, self.total_size
        )
    }

    pub fn closing(&self) -> String {
        format!("\r\n--{}--\r\n", self.boundary)
    }

    /// Exact length of the body, framing included.
    pub fn content_length(&self) -> u64 {
        let parts: u64 = self
            .windows
            .iter()
            .map(|window| window.len() + self.part_header(window).len() as u64)
            .sum();
        parts + self.closing().len() as u64
    }
}

/// generate a unique boundary string for multipart responses
fn generate_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_nanos());
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("RANGE_BOUNDARY-{:x}{:04x}", timestamp, sequence & 0xffff)
}
