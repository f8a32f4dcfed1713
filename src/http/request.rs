//! Request descriptors.
//!
//! A [`Request`] identifies one outbound resource fetch: method, absolute URL,
//! headers and body. The host server builds them from raw HTTP/1.1 bytes with
//! [`Request::parse`]; library callers use the builder methods.

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while building or parsing a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request target must be absolute or start with '/': {target}")]
    InvalidTarget { target: String },
}

/// A request descriptor.
///
/// Cloning is cheap: the body is a reference-counted [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use cachefront::http::{Method, Request};
///
/// let request = Request::get("http://localhost:8000/app.js")
///     .unwrap()
///     .header("Accept", "*/*");
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.url().path(), "/app.js");
/// assert_eq!(request.headers().get("accept"), Some("*/*"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a `GET` request for an absolute URL.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidUrl`] if `url` does not parse.
    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::Get, Url::parse(url)?))
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Origin-form targets (`/app.js?v=2`) are resolved against `base`, keeping
    /// its scheme, host and port. Absolute-form targets (`http://host/app.js`)
    /// are used as-is.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf`. The body holds at most `Content-Length` bytes of what is
    /// already buffered; callers compare `offset + content_length` against the
    /// buffer length to know whether the body is complete.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the request headers.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidTarget`] / [`RequestError::InvalidUrl`] — the target
    ///   cannot be turned into an absolute URL.
    pub fn parse(buf: &[u8], base: &Url) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let url = resolve_target(target, base)?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let mut request = Self {
            method,
            url,
            version,
            headers: header_map,
            body: Bytes::new(),
        };

        let available = &buf[body_offset..];
        let wanted = request.content_length().unwrap_or(0).min(available.len());
        request.body = Bytes::copy_from_slice(&available[..wanted]);

        Ok((request, body_offset))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the path plus query string, as sent on an HTTP/1.1 request line.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_owned(),
        }
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

// Turns an HTTP request-target into an absolute URL.
fn resolve_target(target: &str, base: &Url) -> Result<Url, RequestError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(Url::parse(target)?);
    }
    if !target.starts_with('/') {
        return Err(RequestError::InvalidTarget {
            target: target.to_owned(),
        });
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let mut url = base.clone();
    url.set_path(path);
    url.set_query(query);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://upstream.test:8000/").unwrap()
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET /app.js HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.url().as_str(), "http://upstream.test:8000/app.js");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn origin_form_keeps_query() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.url().path(), "/search");
        assert_eq!(req.url().query(), Some("q=rust&page=2"));
        assert_eq!(req.path_and_query(), "/search?q=rust&page=2");
    }

    #[test]
    fn scheme_relative_target_cannot_change_host() {
        let raw = b"GET //evil.test/x HTTP/1.1\r\nHost: a\r\n\r\n";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.url().host_str(), Some("upstream.test"));
    }

    #[test]
    fn absolute_form_is_used_verbatim() {
        let raw = b"GET http://other.test/lib.js HTTP/1.1\r\nHost: other.test\r\n\r\n";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.url().as_str(), "http://other.test/lib.js");
    }

    #[test]
    fn asterisk_target_is_rejected() {
        let raw = b"OPTIONS * HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(matches!(
            Request::parse(raw, &base()),
            Err(RequestError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            Request::parse(raw, &base()),
            Err(RequestError::Incomplete)
        ));
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn http10_defaults_to_close() {
        let raw = b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_is_bounded_by_content_length() {
        let raw = b"POST /log HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n";
        let (req, offset) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.body_bytes().as_ref(), b"hello");
        assert_eq!(&raw[offset..offset + 5], b"hello");
    }

    #[test]
    fn partial_body_is_truncated_to_what_arrived() {
        let raw = b"POST /log HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nhel";
        let (req, _) = Request::parse(raw, &base()).unwrap();
        assert_eq!(req.body_bytes().as_ref(), b"hel");
    }

    #[test]
    fn builder_sets_body_and_headers() {
        let req = Request::new(Method::Post, base().join("/submit").unwrap())
            .header("Content-Type", "application/json")
            .body("{}");
        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.body_bytes().as_ref(), b"{}");
        assert_eq!(req.headers().get("content-type"), Some("application/json"));
    }
}
