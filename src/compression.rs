//! `Accept-Encoding` negotiation and the streaming gzip/deflate transform.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::Method;
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures::{ready, Stream, StreamExt};

use crate::context::{Encoding, ResponseContext};

/// Default minimum body size, in bytes, worth compressing.
pub const DEFAULT_THRESHOLD: u64 = 1024;

/// Codings a client is willing to receive, after `q=0` entries are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedEncodings {
    pub gzip: bool,
    pub deflate: bool,
    pub identity: bool,
}

impl AcceptedEncodings {
    /// Parses an `Accept-Encoding` value. `*` accepts the codings offered
    /// here that are not listed by name.
    pub fn parse(header: &str) -> Self {
        // Some(weight > 0) once a coding is listed by name
        let (mut gzip, mut deflate, mut identity, mut any) = (None, None, None, None);
        for entry in header.split(',') {
            let mut params = entry.split(';');
            let coding = params.next().unwrap_or_default().trim();
            if coding.is_empty() {
                continue;
            }
            let accepted = Some(quality(params) > 0.0);
            match coding.to_ascii_lowercase().as_str() {
                "gzip" | "x-gzip" => gzip = accepted,
                "deflate" => deflate = accepted,
                "identity" => identity = accepted,
                "*" => any = accepted,
                _ => {}
            }
        }

        let any = any.unwrap_or(false);
        AcceptedEncodings {
            gzip: gzip.unwrap_or(any),
            deflate: deflate.unwrap_or(any),
            identity: identity.unwrap_or(false),
        }
    }

    /// Preferred coding, gzip before deflate.
    pub fn preferred(&self) -> Encoding {
        if self.identity {
            Encoding::Identity
        } else if self.gzip {
            Encoding::Gzip
        } else if self.deflate {
            Encoding::Deflate
        } else {
            Encoding::Identity
        }
    }
}

fn quality<'a>(params: impl Iterator<Item = &'a str>) -> f32 {
    for param in params {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("q") {
                // an unreadable weight counts as not acceptable
                return value.trim().parse().unwrap_or(0.0);
            }
        }
    }
    1.0
}

/// Decides the content coding of the response body.
///
/// Unless the response is marked `no-transform`, `Vary: Accept-Encoding` is
/// recorded even when the outcome is identity. Choosing gzip or deflate sets
/// `Content-Encoding` and removes the fixed `Content-Length`.
///
/// Must only be called for responses that are not ranged.
pub fn negotiate(method: &Method, accept_encoding: Option<&str>, ctx: &mut ResponseContext, threshold: u64) -> Encoding {
    if ctx.no_transform() {
        return Encoding::Identity;
    }
    ctx.vary_accept_encoding = true;

    if *method != Method::GET || ctx.content_encoding != Encoding::Identity {
        return Encoding::Identity;
    }
    match ctx.content_length {
        Some(length) if length >= threshold => {}
        _ => return Encoding::Identity,
    }
    let Some(accept_encoding) = accept_encoding else {
        return Encoding::Identity;
    };

    let encoding = AcceptedEncodings::parse(accept_encoding).preferred();
    if encoding != Encoding::Identity {
        ctx.content_length = None;
        ctx.content_encoding = encoding;
    }
    tracing::debug!(accept_encoding, encoding = encoding.as_str(), "encoding negotiated");
    encoding
}

enum Encoder {
    Identity,
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(encoding: Encoding, level: u32) -> Self {
        let level = Compression::new(level.min(9));
        match encoding {
            Encoding::Identity => Encoder::Identity,
            Encoding::Gzip => Encoder::Gzip(GzEncoder::new(Vec::new(), level)),
            Encoding::Deflate => Encoder::Deflate(ZlibEncoder::new(Vec::new(), level)),
        }
    }

    /// Feeds `chunk` in and takes whatever compressed output is ready.
    fn write(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        let output = match self {
            Encoder::Identity => return Ok(chunk),
            Encoder::Gzip(encoder) => {
                encoder.write_all(&chunk)?;
                encoder.get_mut()
            }
            Encoder::Deflate(encoder) => {
                encoder.write_all(&chunk)?;
                encoder.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(output)))
    }

    fn finish(self) -> io::Result<Bytes> {
        let output = match self {
            Encoder::Identity => return Ok(Bytes::new()),
            Encoder::Gzip(encoder) => encoder.finish()?,
            Encoder::Deflate(encoder) => encoder.finish()?,
        };
        Ok(Bytes::from(output))
    }
}

/// Compresses a chunk stream on the fly. Implements [`Stream`].
///
/// Only as much of the source is pulled as the consumer asks for. With
/// [`Encoding::Identity`] chunks pass through untouched.
pub struct CompressedStream<S> {
    source: Option<S>,
    encoder: Option<Encoder>,
    encoding: Encoding,
}

impl<S> CompressedStream<S> {
    pub fn new(source: S, encoding: Encoding, level: u32) -> Self {
        CompressedStream {
            source: Some(source),
            encoder: Some(Encoder::new(encoding, level)),
            encoding,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl<S: Stream<Item = io::Result<Bytes>> + Unpin> Stream for CompressedStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let this = &mut *self;

        loop {
            let Some(encoder) = this.encoder.as_mut() else {
                return Poll::Ready(None);
            };

            let next = match this.source.as_mut() {
                Some(source) => ready!(source.poll_next_unpin(cx)),
                None => None,
            };

            match next {
                Some(Ok(chunk)) => match encoder.write(chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Poll::Ready(Some(Ok(out))),
                    Err(e) => {
                        this.source = None;
                        this.encoder = None;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Some(Err(e)) => {
                    this.source = None;
                    this.encoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.source = None;
                    let Some(encoder) = this.encoder.take() else {
                        return Poll::Ready(None);
                    };
                    return match encoder.finish() {
                        Ok(out) if out.is_empty() => Poll::Ready(None),
                        result => Poll::Ready(Some(result)),
                    };
                }
            }
        }
    }
}

impl<S> std::fmt::Debug for CompressedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedStream")
            .field("encoding", &self.encoding)
            .field("finished", &self.encoder.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::{GzDecoder, ZlibDecoder};
    use futures::stream;

    use super::*;

    fn ctx(length: u64) -> ResponseContext {
        ResponseContext::new(length)
    }

    fn content(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog\n".iter().copied().cycle().take(len).collect()
    }

    async fn compress(data: &[u8], chunk_size: usize, encoding: Encoding) -> Vec<u8> {
        let chunks: Vec<io::Result<Bytes>> = data.chunks(chunk_size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let stream = CompressedStream::new(stream::iter(chunks), encoding, 6);
        let parts: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
        parts.concat()
    }

    #[test]
    fn test_parse_accept_encoding() {
        let accepted = AcceptedEncodings::parse("gzip, deflate, br");
        assert!(accepted.gzip && accepted.deflate && !accepted.identity);

        let accepted = AcceptedEncodings::parse("deflate;q=0.5, gzip;q=0");
        assert!(!accepted.gzip && accepted.deflate);

        let accepted = AcceptedEncodings::parse("*");
        assert_eq!(Encoding::Gzip, accepted.preferred());

        let accepted = AcceptedEncodings::parse("identity;q=0, gzip");
        assert_eq!(Encoding::Gzip, accepted.preferred());

        assert_eq!(AcceptedEncodings::default(), AcceptedEncodings::parse(""));
        assert_eq!(AcceptedEncodings::default(), AcceptedEncodings::parse("*;q=0"));
        assert_eq!(AcceptedEncodings::default(), AcceptedEncodings::parse("gzip;q=bogus"));
    }

    #[test]
    fn test_wildcard_does_not_override_refusals() {
        for header in ["gzip;q=0, *", "*, gzip;q=0"] {
            let accepted = AcceptedEncodings::parse(header);
            assert!(!accepted.gzip, "{header}");
            assert!(accepted.deflate, "{header}");
            assert_eq!(Encoding::Deflate, accepted.preferred(), "{header}");
        }

        let accepted = AcceptedEncodings::parse("*, gzip;q=0, deflate;q=0");
        assert_eq!(Encoding::Identity, accepted.preferred());

        let mut ctx = ctx(2048);
        assert_eq!(Encoding::Deflate, negotiate(&Method::GET, Some("gzip;q=0, *"), &mut ctx, DEFAULT_THRESHOLD));
        assert_eq!(Encoding::Deflate, ctx.content_encoding);
    }

    #[test]
    fn test_negotiate_gzip() {
        let mut ctx = ctx(2048);
        let encoding = negotiate(&Method::GET, Some("gzip"), &mut ctx, DEFAULT_THRESHOLD);
        assert_eq!(Encoding::Gzip, encoding);
        assert_eq!(Encoding::Gzip, ctx.content_encoding);
        assert_eq!(None, ctx.content_length);
        assert!(ctx.vary_accept_encoding);
    }

    #[test]
    fn test_gzip_preferred_over_deflate() {
        let mut ctx = ctx(2048);
        assert_eq!(Encoding::Gzip, negotiate(&Method::GET, Some("deflate, gzip"), &mut ctx, DEFAULT_THRESHOLD));

        let mut ctx = self::ctx(2048);
        assert_eq!(Encoding::Deflate, negotiate(&Method::GET, Some("deflate"), &mut ctx, DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_identity_outcomes_still_vary() {
        let cases: [(Method, Option<&str>, u64); 5] = [
            (Method::GET, Some("gzip"), 1023),
            (Method::HEAD, Some("gzip"), 2048),
            (Method::GET, None, 2048),
            (Method::GET, Some("identity, gzip"), 2048),
            (Method::GET, Some("br"), 2048),
        ];
        for (method, accept, length) in cases {
            let mut ctx = ctx(length);
            assert_eq!(Encoding::Identity, negotiate(&method, accept, &mut ctx, DEFAULT_THRESHOLD));
            assert_eq!(Some(length), ctx.content_length);
            assert_eq!(Encoding::Identity, ctx.content_encoding);
            assert!(ctx.vary_accept_encoding);
        }
    }

    #[test]
    fn test_already_encoded() {
        let mut ctx = ctx(2048);
        ctx.content_encoding = Encoding::Deflate;
        assert_eq!(Encoding::Identity, negotiate(&Method::GET, Some("gzip"), &mut ctx, DEFAULT_THRESHOLD));
        assert_eq!(Encoding::Deflate, ctx.content_encoding);
        assert_eq!(Some(2048), ctx.content_length);
    }

    #[test]
    fn test_no_transform_skips_negotiation() {
        let mut ctx = ctx(2048).with_cache_control("public, max-age=0, no-transform");
        assert_eq!(Encoding::Identity, negotiate(&Method::GET, Some("gzip"), &mut ctx, DEFAULT_THRESHOLD));
        assert!(!ctx.vary_accept_encoding);
        assert_eq!(Some(2048), ctx.content_length);
    }

    #[test]
    fn test_unknown_length() {
        let mut ctx = ctx(2048);
        ctx.content_length = None;
        assert_eq!(Encoding::Identity, negotiate(&Method::GET, Some("gzip"), &mut ctx, DEFAULT_THRESHOLD));
    }

    #[tokio::test]
    async fn test_gzip_stream() {
        let data = content(10_000);
        let compressed = compress(&data, 1000, Encoding::Gzip).await;
        assert!(compressed.len() < data.len());

        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut decoded).unwrap();
        assert_eq!(data, decoded);
    }

    #[tokio::test]
    async fn test_deflate_stream_is_zlib() {
        let data = content(4096);
        let compressed = compress(&data, 7, Encoding::Deflate).await;

        let mut decoded = Vec::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut decoded).unwrap();
        assert_eq!(data, decoded);
    }

    #[tokio::test]
    async fn test_identity_passes_through() {
        let data = content(100);
        assert_eq!(data, compress(&data, 30, Encoding::Identity).await);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let compressed = compress(&[], 1, Encoding::Gzip).await;
        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut decoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_source_error_ends_stream() {
        let chunks = vec![
            Ok(Bytes::from(content(64))),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
        ];
        let mut stream = CompressedStream::new(stream::iter(chunks), Encoding::Gzip, 6);
        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert_eq!(io::ErrorKind::BrokenPipe, e.kind());
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(stream.next().await.is_none());
    }
}
