//! Response metadata shared by every stage of the pipeline.
//!
//! A [`ResponseContext`] is created once per request by [`ResponseContext::basic`]
//! and then handed by `&mut` through the conditional, range and compression
//! stages in that order. It is rendered into a [`HeaderMap`] exactly once,
//! before the first body byte is produced.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG, VARY};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, HeaderMapExt, LastModified};

use crate::config::SendConfig;
use crate::resolve::{etag, mime_type, Metadata};

/// Content coding applied to the transmitted body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    /// Token used in `Accept-Encoding` and `Content-Encoding`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Status and representation metadata of the response being built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub etag: Option<String>,
    /// Modification time, truncated to whole seconds.
    pub last_modified: Option<SystemTime>,
    pub content_type: String,
    /// Length of the transmitted body. `None` once it can no longer be known
    /// ahead of time (compressed bodies).
    pub content_length: Option<u64>,
    pub content_encoding: Encoding,
    pub accept_ranges: bool,
    pub content_range: Option<ContentRange>,
    pub cache_control: String,
    pub vary_accept_encoding: bool,
    /// Raw size of the byte source. Never changes.
    pub resource_size: u64,
}

impl ResponseContext {
    /// A bare 200 context for a resource of `resource_size` bytes.
    pub fn new(resource_size: u64) -> Self {
        ResponseContext {
            status: StatusCode::OK,
            etag: None,
            last_modified: None,
            content_type: mime_guess::mime::APPLICATION_OCTET_STREAM.to_string(),
            content_length: Some(resource_size),
            content_encoding: Encoding::Identity,
            accept_ranges: false,
            content_range: None,
            cache_control: SendConfig::default().cache_control(),
            vary_accept_encoding: false,
            resource_size,
        }
    }

    /// Basic headers stage: validators, type, length and caching policy.
    pub fn basic(path: &Path, metadata: &Metadata, config: &SendConfig) -> Self {
        ResponseContext {
            etag: Some(etag(metadata)),
            last_modified: metadata.modified.map(truncate_to_secs),
            content_type: mime_type(path),
            cache_control: config.cache_control(),
            ..ResponseContext::new(metadata.size)
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, modified: SystemTime) -> Self {
        self.last_modified = Some(truncate_to_secs(modified));
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = cache_control.into();
        self
    }

    /// Whether `Cache-Control` forbids intermediaries from transforming the body.
    pub fn no_transform(&self) -> bool {
        self.cache_control
            .split(',')
            .any(|directive| directive.trim().eq_ignore_ascii_case("no-transform"))
    }

    /// Renders the context into response headers.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        insert_str(&mut headers, CACHE_CONTROL, &self.cache_control);
        if let Some(etag) = &self.etag {
            insert_str(&mut headers, ETAG, etag);
        }
        if let Some(modified) = self.last_modified {
            headers.typed_insert(LastModified::from(modified));
        }

        // a 304 describes the stored representation, not a body
        if self.status == StatusCode::NOT_MODIFIED {
            return headers;
        }

        insert_str(&mut headers, CONTENT_TYPE, &self.content_type);
        if let Some(length) = self.content_length {
            headers.typed_insert(ContentLength(length));
        }
        if self.accept_ranges {
            headers.typed_insert(AcceptRanges::bytes());
        }
        if let Some(content_range) = &self.content_range {
            headers.typed_insert(content_range.clone());
        }
        if self.content_encoding != Encoding::Identity {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(self.content_encoding.as_str()));
        }
        if self.vary_accept_encoding {
            headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
        }
        headers
    }
}

fn insert_str(headers: &mut HeaderMap, name: axum::http::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, value, "dropping header with invalid value"),
    }
}

/// HTTP dates carry whole seconds, so validators are compared at that precision.
pub(crate) fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, LAST_MODIFIED};

    fn metadata() -> Metadata {
        Metadata {
            size: 9,
            modified: Some(UNIX_EPOCH + Duration::from_millis(1_700_000_000_250)),
        }
    }

    #[test]
    fn test_basic_headers() {
        let ctx = ResponseContext::basic(Path::new("test/nums.txt"), &metadata(), &SendConfig::default());
        assert_eq!(StatusCode::OK, ctx.status);
        assert_eq!(Some(9), ctx.content_length);
        assert_eq!("text/plain", ctx.content_type);
        assert_eq!(Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)), ctx.last_modified);

        let headers = ctx.headers();
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=0");
        assert_eq!(headers[CONTENT_LENGTH], "9");
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers[LAST_MODIFIED], "Tue, 14 Nov 2023 22:13:20 GMT");
        assert!(headers.contains_key(ETAG));
        assert!(!headers.contains_key(ACCEPT_RANGES));
    }

    #[test]
    fn test_unknown_extension_is_octet_stream() {
        let ctx = ResponseContext::basic(Path::new("blob.unknownext"), &metadata(), &SendConfig::default());
        assert_eq!("application/octet-stream", ctx.content_type);
    }

    #[test]
    fn test_not_modified_headers() {
        let mut ctx = ResponseContext::new(9).with_etag("\"abc\"");
        ctx.status = StatusCode::NOT_MODIFIED;
        let headers = ctx.headers();
        assert_eq!(headers[ETAG], "\"abc\"");
        assert!(!headers.contains_key(CONTENT_LENGTH));
        assert!(!headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn test_no_transform() {
        let ctx = ResponseContext::new(9).with_cache_control("public, No-Transform");
        assert!(ctx.no_transform());
        assert!(!ResponseContext::new(9).no_transform());
    }

    #[test]
    fn test_encoding_headers() {
        let mut ctx = ResponseContext::new(2048);
        ctx.content_encoding = Encoding::Gzip;
        ctx.content_length = None;
        ctx.vary_accept_encoding = true;
        let headers = ctx.headers();
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[VARY], "Accept-Encoding");
        assert!(!headers.contains_key(CONTENT_LENGTH));
    }
}
