//! Minimal async HTTP/1.1 client over Tokio TCP.
//!
//! One connection per request (`Connection: close`). Response heads are parsed
//! with [`httparse`]; bodies framed by `Content-Length`, chunked
//! transfer-encoding, or connection close are read in full before the
//! [`Response`] is returned.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{FetchError, Fetcher, forwards_header, strip_framing};
use crate::BoxFuture;
use crate::config::FetcherConfig;
use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Maximum number of response headers we accept.
const MAX_HEADERS: usize = 100;

/// Initial read buffer capacity per exchange.
const INITIAL_BUF_SIZE: usize = 8192;

/// Minimal HTTP/1.1 [`Fetcher`]. Speaks plain `http://` only; see
/// [`ReqwestFetcher`](super::ReqwestFetcher) for `https://`.
///
/// # Examples
///
/// ```rust,no_run
/// use cachefront::network::{Fetcher, HttpFetcher};
/// use cachefront::Request;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpFetcher::default();
/// let request = Request::get("http://127.0.0.1:8000/index.html")?;
/// let mut response = fetcher.fetch(&request).await?;
/// println!("{} {}", response.status(), response.text()?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, FetchError> {
        let url = request.url();
        if url.scheme() != "http" {
            return Err(FetchError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let host = url.host_str().ok_or(FetchError::MissingHost)?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");

        let connect_timeout = self.config.connect_timeout();
        let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(FetchError::Connect { addr, source }),
            Err(_) => return Err(FetchError::Timeout(connect_timeout)),
        };
        trace!(addr = %addr, "connected");

        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        stream.write_all(&encode_request(request, &host_header)).await?;
        stream.flush().await?;

        let bodyless = request.method() == &Method::Head;
        read_response(&mut stream, bodyless, self.config.max_response_bytes).await
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(async move {
            let timeout = self.config.request_timeout();
            let result = match tokio::time::timeout(timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            };
            if let Ok(response) = &result {
                debug!(
                    method = %request.method(),
                    url = %request.url(),
                    status = response.status().as_u16(),
                    "fetched"
                );
            }
            result
        })
    }
}

// Serializes the request head and body.
fn encode_request(request: &Request, host: &str) -> BytesMut {
    let body = request.body_bytes();
    let mut buf = BytesMut::with_capacity(256 + request.headers().len() * 64 + body.len());

    buf.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", request.method(), request.path_and_query()).as_bytes(),
    );
    buf.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    for (name, value) in request.headers().iter().filter(|(name, _)| forwards_header(name)) {
        buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.extend_from_slice(b"Connection: close\r\n");

    let sends_body = !body.is_empty()
        || matches!(request.method(), Method::Post | Method::Put | Method::Patch);
    if sends_body {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    buf
}

struct Head {
    status: StatusCode,
    headers: Headers,
    len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, FetchError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);
    let len = match raw.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let code = raw.code.unwrap_or(0);
    let status = StatusCode::from_u16(code).ok_or(FetchError::InvalidStatus(code))?;

    let mut header_map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            header_map.insert(header.name, value);
        }
    }

    Ok(Some(Head {
        status,
        headers: header_map,
        len,
    }))
}

/// Reads one complete response from `stream`.
///
/// `bodyless` is set for responses to `HEAD`, which never carry a body.
async fn read_response<S>(
    stream: &mut S,
    bodyless: bool,
    max_bytes: usize,
) -> Result<Response, FetchError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    let head = loop {
        if let Some(head) = parse_head(&buf)? {
            buf.advance(head.len);
            // Interim responses (100 Continue, 103 Early Hints) precede the real one.
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            break head;
        }
        if buf.len() > max_bytes {
            return Err(FetchError::ResponseTooLarge { max_bytes });
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(FetchError::IncompleteHead);
        }
    };

    let Head {
        status,
        mut headers,
        ..
    } = head;

    let body = if bodyless || status.forbids_body() {
        BytesMut::new()
    } else if is_chunked(&headers) {
        read_chunked(stream, buf, max_bytes).await?
    } else if let Some(length) = content_length(&headers)? {
        read_exact_len(stream, buf, length, max_bytes).await?
    } else {
        read_to_close(stream, buf, max_bytes).await?
    };

    strip_framing(&mut headers, bodyless);
    Ok(Response::from_parts(status, headers, body.freeze()))
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &Headers) -> Result<Option<usize>, FetchError> {
    match headers.get("content-length") {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FetchError::Parse(httparse::Error::HeaderValue)),
        None => Ok(None),
    }
}

async fn read_more<S>(stream: &mut S, buf: &mut BytesMut) -> Result<(), FetchError>
where
    S: AsyncRead + Unpin,
{
    if stream.read_buf(buf).await? == 0 {
        return Err(FetchError::IncompleteBody);
    }
    Ok(())
}

async fn read_exact_len<S>(
    stream: &mut S,
    mut buf: BytesMut,
    length: usize,
    max_bytes: usize,
) -> Result<BytesMut, FetchError>
where
    S: AsyncRead + Unpin,
{
    if length > max_bytes {
        return Err(FetchError::ResponseTooLarge { max_bytes });
    }
    while buf.len() < length {
        read_more(stream, &mut buf).await?;
    }
    buf.truncate(length);
    Ok(buf)
}

async fn read_to_close<S>(
    stream: &mut S,
    mut buf: BytesMut,
    max_bytes: usize,
) -> Result<BytesMut, FetchError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if buf.len() > max_bytes {
            return Err(FetchError::ResponseTooLarge { max_bytes });
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(buf);
        }
    }
}

async fn read_chunked<S>(
    stream: &mut S,
    mut buf: BytesMut,
    max_bytes: usize,
) -> Result<BytesMut, FetchError>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();

    loop {
        let (size_line, size) = loop {
            match httparse::parse_chunk_size(&buf) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => read_more(stream, &mut buf).await?,
                Err(_) => return Err(FetchError::InvalidChunk),
            }
        };

        // Trailers after the last chunk are ignored; the connection closes anyway.
        if size == 0 {
            return Ok(body);
        }

        let size = usize::try_from(size).map_err(|_| FetchError::InvalidChunk)?;
        if body.len().saturating_add(size) > max_bytes {
            return Err(FetchError::ResponseTooLarge { max_bytes });
        }

        let needed = size_line + size + 2;
        while buf.len() < needed {
            read_more(stream, &mut buf).await?;
        }
        if &buf[size_line + size..needed] != b"\r\n" {
            return Err(FetchError::InvalidChunk);
        }
        body.extend_from_slice(&buf[size_line..size_line + size]);
        buf.advance(needed);
    }
}
