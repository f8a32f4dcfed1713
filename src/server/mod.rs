//! Async HTTP/1.1 host using Tokio.
//!
//! The server is the environment that delivers request events: every inbound
//! request becomes one [`FetchEvent`] handed to the registered
//! [`RequestInterceptor`]. Origin-form targets are resolved against the
//! configured upstream origin, so the server works as a caching reverse proxy.
//!
//! Interceptor failures are presented the host's way, as plain error
//! responses: `504` for network timeouts, `502` for other network failures,
//! `500` for cache failures.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::http::{Method, Request, Response, StatusCode, request::RequestError};
use crate::interceptor::{FetchEvent, InterceptError, RequestInterceptor};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The cachefront host server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use cachefront::cache::MemoryCacheStorage;
/// use cachefront::config::CacheConfig;
/// use cachefront::interceptor::CacheFirst;
/// use cachefront::network::HttpFetcher;
/// use cachefront::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let interceptor = Arc::new(CacheFirst::new(
///         Arc::new(MemoryCacheStorage::new()),
///         Arc::new(HttpFetcher::default()),
///         CacheConfig::default(),
///     ));
///     let upstream = "http://127.0.0.1:8000".parse()?;
///     let server = Server::bind("127.0.0.1:8080", upstream).await?;
///     server.run(interceptor).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    upstream: Arc<Url>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// `upstream` is the origin that origin-form request targets resolve against.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>, upstream: Url) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            upstream: Arc::new(upstream),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the upstream origin.
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Accepts connections forever, handing each request to `interceptor`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<I>(self, interceptor: Arc<I>) -> Result<(), ServerError>
    where
        I: RequestInterceptor + ?Sized + 'static,
    {
        self.run_until(interceptor, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting connections once
    /// `shutdown` resolves. Connections already accepted finish on their own.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<I, S>(self, interceptor: Arc<I>, shutdown: S) -> Result<(), ServerError>
    where
        I: RequestInterceptor + ?Sized + 'static,
        S: Future<Output = ()>,
    {
        info!(address = %self.local_addr, upstream = %self.upstream, "cachefront listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let interceptor = Arc::clone(&interceptor);
            let upstream = Arc::clone(&self.upstream);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, interceptor, upstream).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Maps an interceptor failure to the response the client sees.
fn failure_response(err: &InterceptError) -> Response {
    let status = match err {
        InterceptError::Network(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        InterceptError::Network(_) => StatusCode::BAD_GATEWAY,
        InterceptError::Cache(_) | InterceptError::Body(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Response::new(status).body(status.canonical_reason())
}

// Reads more bytes into `buf`. Returns `false` once the peer has closed.
async fn fill(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<bool, std::io::Error> {
    Ok(stream.read_buf(buf).await? > 0)
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, handling one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<I>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    interceptor: Arc<I>,
    upstream: Arc<Url>,
) -> Result<(), std::io::Error>
where
    I: RequestInterceptor + ?Sized + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            write_response(&mut stream, too_large(), false).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf, &upstream) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if !fill(&mut stream, &mut buf).await? {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                write_response(
                    &mut stream,
                    Response::new(StatusCode::BAD_REQUEST)
                        .body(format!("Bad Request: {e}"))
                        .keep_alive(false),
                    false,
                )
                .await?;
                break;
            }
        };

        // The declared body must fit before any of it is buffered.
        let total_needed = match request_size(body_offset, request.content_length()) {
            Some(total) => total,
            None => {
                warn!(
                    peer = %peer_addr,
                    content_length = ?request.content_length(),
                    "declared body too large — sending 413"
                );
                write_response(&mut stream, too_large(), false).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        if buf.len() < total_needed {
            if !fill(&mut stream, &mut buf).await? {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }

        let keep_alive = request.is_keep_alive();
        let is_head = request.method() == &Method::Head;

        let event = FetchEvent::new(request);
        debug!(
            peer = %peer_addr,
            method = %event.request().method(),
            url = %event.request().url(),
            "dispatching request event"
        );

        let response = match interceptor.intercept(event).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "request event failed");
                failure_response(&e)
            }
        };
        write_response(&mut stream, response.keep_alive(keep_alive), is_head).await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false)
}

// Bytes the whole request occupies in the buffer, or `None` if the declared
// body would push it past `MAX_REQUEST_SIZE`.
fn request_size(body_offset: usize, content_length: Option<usize>) -> Option<usize> {
    body_offset
        .checked_add(content_length.unwrap_or(0))
        .filter(|&total| total <= MAX_REQUEST_SIZE)
}

// `head_only` answers a HEAD request: headers as for GET, no payload.
async fn write_response(
    stream: &mut TcpStream,
    response: Response,
    head_only: bool,
) -> Result<(), std::io::Error> {
    let serialized = if head_only {
        response.into_head_bytes()
    } else {
        response.into_bytes()
    };
    let bytes = match serialized {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "interceptor returned an unreadable response");
            failure_response(&InterceptError::Body(e))
                .keep_alive(false)
                .into_bytes()
                .map_err(std::io::Error::other)?
        }
    };
    stream.write_all(&bytes).await?;
    stream.flush().await
}
