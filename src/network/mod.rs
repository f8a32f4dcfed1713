//! Network access — the fallback the interceptor uses on a cache miss.
//!
//! [`Fetcher`] is the seam: the interceptor only ever calls
//! [`Fetcher::fetch`]. Two implementations are bundled:
//!
//! - [`HttpFetcher`] — a minimal HTTP/1.1 client over a fresh TCP connection
//!   per request. Plain `http://` only.
//! - [`ReqwestFetcher`] — a pooled [`reqwest`] client with rustls, for
//!   `http://` and `https://` upstreams.

use std::time::Duration;

use thiserror::Error;

use crate::BoxFuture;
use crate::http::headers::HOP_BY_HOP;
use crate::http::{Headers, Request, Response};

pub mod client;
pub mod reqwest_client;

pub use client::HttpFetcher;
pub use reqwest_client::ReqwestFetcher;

/// Errors produced by a network fetch. None of them are retried.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("request URL has no host")]
    MissingHost,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("response has invalid status {0}")]
    InvalidStatus(u16),

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("connection closed before the response head was complete")]
    IncompleteHead,

    #[error("connection closed before the response body was complete")]
    IncompleteBody,

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },

    #[error("method {0:?} cannot be sent")]
    InvalidMethod(String),

    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// Returns `true` if the fetch gave up because a deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Performs network requests.
///
/// # Contract
///
/// - Any response the server sends, whatever its status, is `Ok`.
/// - Transport failures (DNS, refused connection, timeout, malformed
///   response) are `Err`.
/// - Implementations do not retry.
pub trait Fetcher: Send + Sync {
    /// Issues `request` and returns the complete response.
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}

// Request headers forwarded upstream. The client sets `Host` and framing itself.
pub(crate) fn forwards_header(name: &str) -> bool {
    !name.eq_ignore_ascii_case("host") && !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

// Drops upstream framing once the body is decoded. A `HEAD` answer keeps its
// `Content-Length`, which describes the resource rather than an empty payload.
pub(crate) fn strip_framing(headers: &mut Headers, head_only: bool) {
    let declared = head_only
        .then(|| headers.get("content-length").map(str::to_owned))
        .flatten();
    headers.strip_hop_by_hop();
    if let Some(length) = declared {
        headers.set("Content-Length", length);
    }
}
