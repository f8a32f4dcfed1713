//! [`Fetcher`] over a pooled [`reqwest::Client`].
//!
//! Connections are reused across requests and `https://` upstreams are
//! reached through rustls. The body is read chunk by chunk, so the size limit
//! trips before an oversized payload is buffered in full.

use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use super::{FetchError, Fetcher, forwards_header, strip_framing};
use crate::BoxFuture;
use crate::config::FetcherConfig;
use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Pooled HTTP/HTTPS [`Fetcher`].
///
/// # Examples
///
/// ```rust,no_run
/// use cachefront::config::FetcherConfig;
/// use cachefront::network::{Fetcher, ReqwestFetcher};
/// use cachefront::Request;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = ReqwestFetcher::new(&FetcherConfig::default())?;
/// let request = Request::get("https://example.com/")?;
/// let response = fetcher.fetch(&request).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    request_timeout: Duration,
    max_response_bytes: usize,
}

impl ReqwestFetcher {
    /// Builds the client with the connect and whole-request timeouts of `config`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Client`] if the TLS backend cannot be initialised.
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
            max_response_bytes: config.max_response_bytes,
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.request_timeout)
        } else {
            FetchError::Client(err)
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, FetchError> {
        let url = request.url();
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| FetchError::InvalidMethod(request.method().to_string()))?;

        let mut builder = self.client.request(method, url.clone());
        for (name, value) in request.headers().iter().filter(|(name, _)| forwards_header(name)) {
            builder = builder.header(name, value);
        }
        if !request.body_bytes().is_empty() {
            builder = builder.body(request.body_bytes().clone());
        }

        let mut upstream = builder.send().await.map_err(|e| self.classify(e))?;

        let code = upstream.status().as_u16();
        let status = StatusCode::from_u16(code).ok_or(FetchError::InvalidStatus(code))?;
        let mut headers: Headers = upstream
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
            .collect();

        let max_bytes = self.max_response_bytes;
        if upstream
            .content_length()
            .is_some_and(|length| length > max_bytes as u64)
        {
            return Err(FetchError::ResponseTooLarge { max_bytes });
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = upstream.chunk().await.map_err(|e| self.classify(e))? {
            if body.len() + chunk.len() > max_bytes {
                return Err(FetchError::ResponseTooLarge { max_bytes });
            }
            body.extend_from_slice(&chunk);
        }

        strip_framing(&mut headers, request.method() == &Method::Head);
        Ok(Response::from_parts(status, headers, body.freeze()))
    }
}

impl Fetcher for ReqwestFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(async move {
            let response = self.exchange(request).await?;
            debug!(
                method = %request.method(),
                url = %request.url(),
                status = response.status().as_u16(),
                "fetched"
            );
            Ok(response)
        })
    }
}
