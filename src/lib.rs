//! # cachefront
//!
//! A cache-first request interceptor. Every intercepted request is answered
//! from a version-labelled cache store when an entry exists; otherwise it is
//! fetched from the network, a copy is written to the store, and the live
//! response is returned.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cachefront::cache::FileCacheStorage;
//! use cachefront::config::CacheConfig;
//! use cachefront::interceptor::{CacheFirst, FetchEvent, RequestInterceptor};
//! use cachefront::network::HttpFetcher;
//! use cachefront::Request;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let interceptor = CacheFirst::new(
//!         Arc::new(FileCacheStorage::new("./cache")),
//!         Arc::new(HttpFetcher::default()),
//!         CacheConfig::default(),
//!     );
//!
//!     let event = FetchEvent::new(Request::get("http://localhost:8000/app.js")?);
//!     let mut response = interceptor.intercept(event).await?;
//!     println!("{}", response.text()?);
//!
//!     interceptor.flush().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod cache;
pub mod config;
pub mod http;
pub mod interceptor;
pub mod network;
pub mod server;

/// A boxed, `Send` future — the return type of every async trait method in
/// this crate, so the traits stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use interceptor::{CacheFirst, FetchEvent, InterceptError, RequestInterceptor};
pub use server::{Server, ServerError};
