//! The pipeline that turns a resolved resource into a response.
//!
//! Stages run in a fixed order against one [`ResponseContext`]: basic
//! headers, conditional evaluation, range planning, compression. Every
//! status and header decision is final before the body is attached, so a
//! short circuit never leaves a half-sent body behind.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::header::{ACCEPT_ENCODING, IF_RANGE, RANGE};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{AbortHandle, Abortable, BoxStream};
use futures::{ready, StreamExt};
use http_body::{Body, Frame, SizeHint};

use crate::compression::{self, CompressedStream};
use crate::conditional::{self, Outcome, RequestValidators};
use crate::config::SendConfig;
use crate::context::{Encoding, ResponseContext};
use crate::error::{Result, SendError};
use crate::range::{self, ByteWindow, RangeDecision};
use crate::resolve::{resolve, Resource};
use crate::stream::{slice, slice_multipart};
use crate::ByteSource;

/// Headers and body of a prepared response. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct StaticResponse {
    context: ResponseContext,
    body: StaticBody,
    abort: AbortHandle,
}

impl StaticResponse {
    fn new(context: ResponseContext, stream: Option<BoxStream<'static, io::Result<Bytes>>>) -> Self {
        let (body, abort) = StaticBody::new(stream, context.content_length);
        StaticResponse { context, body, abort }
    }

    pub fn status(&self) -> StatusCode {
        self.context.status
    }

    pub fn context(&self) -> &ResponseContext {
        &self.context
    }

    /// Handle that stops the body from pulling any further chunks. The byte
    /// source is released and the body ends with an error, so the transport
    /// drops the connection instead of finishing the response.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

impl IntoResponse for StaticResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(axum::body::Body::new(self.body));
        *response.status_mut() = self.context.status;
        *response.headers_mut() = self.context.headers();
        response
    }
}

/// Response body. Implements [`Body`].
pub struct StaticBody {
    stream: Option<Abortable<BoxStream<'static, io::Result<Bytes>>>>,
    length: Option<u64>,
}

impl StaticBody {
    fn new(stream: Option<BoxStream<'static, io::Result<Bytes>>>, length: Option<u64>) -> (Self, AbortHandle) {
        let (abort, registration) = AbortHandle::new_pair();
        let body = match stream {
            Some(stream) => StaticBody {
                stream: Some(Abortable::new(stream, registration)),
                length,
            },
            None => StaticBody {
                stream: None,
                length: Some(0),
            },
        };
        (body, abort)
    }
}

impl std::fmt::Debug for StaticBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticBody")
            .field("length", &self.length)
            .field("finished", &self.stream.is_none())
            .finish()
    }
}

impl Body for StaticBody {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::default(),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.stream.is_none()
    }

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        let this = &mut *self;
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(stream.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "response body failed");
                this.stream = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                let aborted = stream.is_aborted();
                // drops the byte source
                this.stream = None;
                if aborted {
                    tracing::debug!("response body aborted");
                    Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "response aborted"))))
                } else {
                    Poll::Ready(None)
                }
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn is_allowed(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Runs the request through every stage and attaches the body.
///
/// The byte source of `resource` is dropped on every path that does not end
/// in a body, and otherwise owned by the returned response.
pub fn prepare<S>(method: &Method, headers: &HeaderMap, resource: Resource<S>, config: &SendConfig) -> Result<StaticResponse>
where
    S: ByteSource + Send + Unpin + 'static,
{
    let Resource { path, metadata, source } = resource;
    if !is_allowed(method) {
        return Err(SendError::MethodNotAllowed);
    }
    if source.byte_size() != metadata.size {
        tracing::warn!(
            path = %path.display(),
            declared = metadata.size,
            source = source.byte_size(),
            "byte source size differs from metadata"
        );
    }

    let mut ctx = ResponseContext::basic(&path, &metadata, config);

    let validators = RequestValidators::from_headers(headers);
    let outcome = conditional::evaluate(&validators, &ctx);
    tracing::trace!(?outcome, "conditionals evaluated");
    match outcome {
        Outcome::Continue => {}
        Outcome::NotModified => {
            ctx.status = StatusCode::NOT_MODIFIED;
            ctx.content_length = None;
            return Ok(StaticResponse::new(ctx, None));
        }
        Outcome::PreconditionFailed => return Err(SendError::PreconditionFailed),
        // with ranges off the Range header is ignored, so this is a plain 412
        Outcome::PreconditionFailedAsRange if !config.accept_ranges => return Err(SendError::PreconditionFailed),
        Outcome::PreconditionFailedAsRange => {
            return Err(SendError::RangeNotSatisfiable { size: ctx.resource_size });
        }
    }

    let decision = if config.accept_ranges {
        range::plan(header_str(headers, RANGE), header_str(headers, IF_RANGE), &mut ctx)
    } else {
        RangeDecision::NotRequested
    };

    let encoding = match &decision {
        RangeDecision::Unsatisfiable(size) => return Err(SendError::RangeNotSatisfiable { size: *size }),
        RangeDecision::NotRequested | RangeDecision::Invalid if config.compression && ctx.status == StatusCode::OK => {
            compression::negotiate(method, header_str(headers, ACCEPT_ENCODING), &mut ctx, config.compression_threshold)
        }
        _ => Encoding::Identity,
    };

    tracing::debug!(
        path = %path.display(),
        status = %ctx.status,
        encoding = encoding.as_str(),
        length = ?ctx.content_length,
        "response prepared"
    );

    if *method == Method::HEAD {
        return Ok(StaticResponse::new(ctx, None));
    }

    let stream = match decision {
        RangeDecision::Single(window) => slice(source, vec![window])?.boxed(),
        RangeDecision::Multi(multipart) => slice_multipart(source, multipart)?.boxed(),
        _ if encoding != Encoding::Identity => {
            let whole = whole(source, ctx.resource_size)?;
            CompressedStream::new(whole, encoding, config.compression_level).boxed()
        }
        _ => whole(source, ctx.resource_size)?,
    };
    Ok(StaticResponse::new(ctx, Some(stream)))
}

/// The whole resource as one window, so a source that runs out before
/// `size` bytes fails the body instead of ending it early.
fn whole<S>(source: S, size: u64) -> Result<BoxStream<'static, io::Result<Bytes>>>
where
    S: ByteSource + Send + Unpin + 'static,
{
    if size == 0 {
        return Ok(futures::stream::empty().boxed());
    }
    Ok(slice(source, vec![ByteWindow::new(0, size - 1)])?.boxed())
}

/// Serves the file `raw_path` names below `root`.
///
/// Every failure becomes a terminal response with the matching status.
pub async fn serve(root: &Path, method: &Method, headers: &HeaderMap, raw_path: &str, config: &SendConfig) -> Response {
    let result = async {
        if !is_allowed(method) {
            return Err(SendError::MethodNotAllowed);
        }
        let resource = resolve(root, raw_path, config).await?;
        prepare(method, headers, resource, config)
    }
    .await;

    match result {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::debug!(path = raw_path, status = %e.status(), error = %e, "request short-circuited");
            e.into_response()
        }
    }
}
