//! Error types for serving a single resource.

use std::io;

use axum::http::header::ALLOW;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentRange, HeaderMapExt};
use thiserror::Error;

/// Result type alias for the send pipeline.
pub type Result<T> = std::result::Result<T, SendError>;

/// Broad classification of a [`SendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request cannot be served as sent. Never retried.
    Client,
    /// Environment fault or a bug in the pipeline.
    Server,
}

/// Errors that terminate a request before its body is sent.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Bad Request")]
    BadRequest,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not Found")]
    NotFound,

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("Precondition Failed")]
    PreconditionFailed,

    #[error("Range Not Satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("byte source ended after {received} bytes, expected at least {expected}")]
    SourceExhausted { expected: u64, received: u64 },

    #[error("slice requested with no byte windows")]
    NoWindows,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// The terminal status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            SendError::BadRequest => StatusCode::BAD_REQUEST,
            SendError::Forbidden => StatusCode::FORBIDDEN,
            SendError::NotFound => StatusCode::NOT_FOUND,
            SendError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            SendError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            SendError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            SendError::SourceExhausted { .. } | SendError::NoWindows | SendError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.status().is_server_error() {
            ErrorKind::Server
        } else {
            ErrorKind::Client
        }
    }

    /// Converts into an [`io::Error`] so it can travel inside a body stream.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            SendError::Io(e) => e,
            SendError::SourceExhausted { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, self),
            other => io::Error::other(other),
        }
    }
}

impl IntoResponse for SendError {
    fn into_response(self) -> Response {
        let status = self.status();
        // server-side detail stays in the log
        let message = match self.kind() {
            ErrorKind::Client => self.to_string(),
            ErrorKind::Server => {
                tracing::warn!(error = %self, "request failed");
                "Internal Server Error".to_string()
            }
        };

        let mut response = (status, message).into_response();
        match self {
            SendError::MethodNotAllowed => {
                response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            }
            SendError::RangeNotSatisfiable { size } => {
                response.headers_mut().typed_insert(ContentRange::unsatisfied_bytes(size));
                response.headers_mut().typed_insert(AcceptRanges::bytes());
            }
            _ => {}
        }
        response
    }
}
