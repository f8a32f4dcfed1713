//! Cache storage — named, version-labelled stores of request → response.
//!
//! The interceptor only depends on the two traits defined here:
//!
//! - [`CacheStorage`] — the registry of named stores (`open`, storage-wide
//!   `match_request`, plus `get` / `has` / `delete` / `keys` for the host).
//! - [`CacheStore`] — one named store (`match_request`, `put`, `delete`, `keys`).
//!
//! Two backends are provided:
//!
//! - [`MemoryCacheStorage`] — process-local, for tests and short-lived hosts.
//! - [`FileCacheStorage`] — one JSON document per store, survives restarts.
//!
//! Entries never expire and are never evicted. Stores are created lazily: a
//! lookup never creates one, `open` registers it and the first `put` persists it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;
use crate::http::{BodyError, Headers, Request, Response, StatusCode};

pub mod file;
pub mod memory;

pub use file::FileCacheStorage;
pub use memory::MemoryCacheStorage;

/// Errors produced by cache storage backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache store name {name:?}")]
    InvalidStoreName { name: String },

    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache store {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cache store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cache store {name:?} has been deleted")]
    StoreDeleted { name: String },

    #[error("cached entry has invalid status {0}")]
    InvalidStatus(u16),

    #[error("response body unavailable: {0}")]
    Body(#[from] BodyError),
}

/// The key a request is stored under: its URL without the fragment.
///
/// The method is not part of the key, so every method maps to the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a request.
    pub fn from_request(request: &Request) -> Self {
        let mut url = request.url().clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A response as it sits in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// Method of the request that populated the entry. Informational.
    pub method: String,
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Unix timestamp (seconds) at which the entry was written.
    pub stored_at: u64,
}

impl StoredResponse {
    /// Captures `response` for `request`, consuming the response body.
    ///
    /// # Errors
    ///
    /// [`CacheError::Body`] if the body was already read.
    pub fn capture(request: &Request, mut response: Response) -> Result<Self, CacheError> {
        let body = response.bytes()?;
        let stored_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: body.to_vec(),
            stored_at,
        })
    }

    /// Rebuilds a fresh, unread [`Response`] from the entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidStatus`] if the persisted status is out of range.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let status =
            StatusCode::from_u16(self.status).ok_or(CacheError::InvalidStatus(self.status))?;
        Ok(Response::from_parts(
            status,
            self.headers.clone(),
            self.body.clone(),
        ))
    }
}

/// One named store of request → response entries.
///
/// Implementations serialize their own writes; concurrent callers need no
/// extra locking.
pub trait CacheStore: Send + Sync {
    /// The store's name (its version label).
    fn name(&self) -> &str;

    /// Returns a fresh copy of the response stored for `request`, if any.
    fn match_request<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Option<Response>, CacheError>>;

    /// Stores `response` under `request`'s key, replacing any previous entry.
    /// Consumes the response body.
    fn put<'a>(
        &'a self,
        request: &'a Request,
        response: Response,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Removes the entry for `request`. Returns `true` if one existed.
    fn delete<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Lists the keys currently stored, in key order.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>>;
}

/// The registry of named stores.
pub trait CacheStorage: Send + Sync {
    /// Opens the store called `name`, creating it if it does not exist yet.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn CacheStore>, CacheError>>;

    /// Returns the store called `name` if it exists. Never creates one.
    fn get<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn CacheStore>>, CacheError>>;

    /// Returns `true` if a store called `name` exists.
    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Deletes the store called `name` and all its entries. Returns `true` if it existed.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Lists store names in creation order.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>>;

    /// Looks `request` up in every existing store, in creation order, and
    /// returns the first match. Never creates a store.
    fn match_request<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
        Box::pin(async move {
            for name in self.keys().await? {
                // Deleted since `keys` was read.
                let Some(store) = self.get(&name).await? else {
                    continue;
                };
                if let Some(response) = store.match_request(request).await? {
                    return Ok(Some(response));
                }
            }
            Ok(None)
        })
    }
}

/// Rejects names that are empty, hidden, or could escape a cache directory.
pub(crate) fn validate_store_name(name: &str) -> Result<(), CacheError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(CacheError::InvalidStoreName {
            name: name.to_owned(),
        });
    }
    Ok(())
}
