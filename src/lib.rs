//! # axum-send
//!
//! Static file responses for [`axum`][1] with conditional requests, byte
//! ranges and on-the-fly compression.
//!
//! A request runs through a fixed pipeline that shares one
//! [`ResponseContext`]: basic headers, [conditional evaluation](evaluate),
//! [range planning](plan) and [compression negotiation](negotiate). Every
//! header is decided before the first body byte is produced. The body is
//! pulled from a [`ByteSource`] strictly front to back, sliced to the
//! requested [`ByteWindow`]s or compressed, and never buffered whole.
//!
//! Any [`AsyncRead`](tokio::io::AsyncRead) can be used as a byte source
//! through the [`KnownSize`] adapter, [`resolve`] does this for files below a
//! root directory.
//!
//! ```
//! use std::path::Path;
//!
//! use axum::Router;
//! use axum::http::{HeaderMap, Method, Uri};
//! use axum::response::Response;
//! use axum::routing::any;
//!
//! use axum_send::{serve, SendConfig};
//!
//! async fn file(method: Method, uri: Uri, headers: HeaderMap) -> Response {
//!     let config = SendConfig::default().with_max_age(3600);
//!     serve(Path::new("public"), &method, &headers, uri.path(), &config).await
//! }
//!
//! let _app = Router::<()>::new().route("/{*path}", any(file));
//! ```
//!
//! [1]: https://docs.rs/axum

mod compression;
mod conditional;
mod config;
mod context;
mod error;
mod file;
mod range;
mod resolve;
mod send;
mod stream;

use std::io;

use bytes::Bytes;
use futures::Stream;

pub use compression::{negotiate, AcceptedEncodings, CompressedStream, DEFAULT_THRESHOLD};
pub use conditional::{evaluate, Outcome, RequestValidators};
pub use config::{SendConfig, MAX_AGE_LIMIT};
pub use context::{Encoding, ResponseContext};
pub use error::{ErrorKind, Result, SendError};
pub use file::KnownSize;
pub use range::{plan, ByteWindow, Multipart, RangeDecision};
pub use resolve::{etag, mime_type, normalize_path, resolve, Metadata, Resource};
pub use send::{prepare, serve, StaticBody, StaticResponse};
pub use stream::{slice, slice_multipart, SlicedStream};

/// A forward-only stream of resource content with a size known up front.
///
/// Chunks arrive in order and are never re-read. A source that ends before
/// [`byte_size`](ByteSource::byte_size) bytes is reported as a stream error
/// by the consumers in this crate.
pub trait ByteSource: Stream<Item = io::Result<Bytes>> {
    /// Total number of bytes in the resource.
    fn byte_size(&self) -> u64;
}
