//! HTTP responses with single-use bodies.
//!
//! A [`Response`] owns a [`Body`] that can be read once. [`Response::try_clone`]
//! is the explicit duplication step needed when the same response has to reach
//! two consumers, such as the caller and a cache store.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Body, BodyError, Headers, StatusCode};

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use cachefront::http::{Response, StatusCode};
///
/// let mut response = Response::new(StatusCode::OK)
///     .header("Content-Type", "text/javascript")
///     .body("console.log(1)");
///
/// let mut copy = response.try_clone().unwrap();
/// assert_eq!(response.text().unwrap(), "console.log(1)");
/// assert_eq!(copy.text().unwrap(), "console.log(1)");
/// assert!(response.body_used());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Creates a response from already-assembled parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` once the body has been read.
    pub fn body_used(&self) -> bool {
        self.body.is_used()
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] on a second read.
    pub fn bytes(&mut self) -> Result<Bytes, BodyError> {
        self.body.take()
    }

    /// Reads the whole body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] on a second read, [`BodyError::Utf8`] if the
    /// payload is not valid UTF-8.
    pub fn text(&mut self) -> Result<String, BodyError> {
        let bytes = self.body.take()?;
        Ok(std::str::from_utf8(&bytes)?.to_owned())
    }

    /// Duplicates this response. Status, headers and body are copied; the two
    /// bodies are consumed independently.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] if the body was read before cloning.
    pub fn try_clone(&self) -> Result<Self, BodyError> {
        Ok(Self {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            keep_alive: self.keep_alive,
        })
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format,
    /// consuming the body.
    ///
    /// Hop-by-hop headers carried over from upstream are dropped and replaced by:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Connection: keep-alive` or `Connection: close`.
    /// - `Content-Length: <n>`, unless the status forbids a body.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] if the body was read before.
    pub fn into_bytes(self) -> Result<BytesMut, BodyError> {
        self.serialize(true)
    }

    /// Serializes the response as the answer to a `HEAD` request: the same
    /// head [`into_bytes`](Self::into_bytes) would write, without the payload.
    ///
    /// `Content-Length` still describes the representation. When the body is
    /// empty (a `HEAD` response fetched from upstream), the length the
    /// upstream declared is kept.
    ///
    /// # Errors
    ///
    /// [`BodyError::AlreadyUsed`] if the body was read before.
    pub fn into_head_bytes(self) -> Result<BytesMut, BodyError> {
        self.serialize(false)
    }

    fn serialize(mut self, with_payload: bool) -> Result<BytesMut, BodyError> {
        let body = self.body.take()?;
        let has_body = !self.status.forbids_body();

        let declared = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        let length = match declared {
            Some(declared) if !with_payload && body.is_empty() => declared,
            _ => body.len(),
        };

        self.headers.strip_hop_by_hop();
        if has_body && length > 0 && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        buf.put(self.headers.to_string().as_bytes());

        if has_body {
            buf.put(format!("Content-Length: {length}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);

        if with_payload && has_body && !body.is_empty() {
            buf.put(body);
        }

        Ok(buf)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
