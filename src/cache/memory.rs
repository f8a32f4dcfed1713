//! In-memory cache storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::{CacheError, CacheKey, CacheStorage, CacheStore, StoredResponse, validate_store_name};
use crate::BoxFuture;
use crate::http::{Request, Response};

/// Process-local [`CacheStorage`]. Contents are lost when the value is dropped.
///
/// # Examples
///
/// ```
/// use cachefront::cache::{CacheStorage, MemoryCacheStorage};
/// use cachefront::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let caches = MemoryCacheStorage::new();
/// let store = caches.open("v1").await?;
/// let request = Request::get("http://localhost/app.js")?;
///
/// store.put(&request, Response::new(StatusCode::OK).body("console.log(1)")).await?;
/// let mut hit = caches.match_request(&request).await?.expect("stored");
/// assert_eq!(hit.text()?, "console.log(1)");
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryCacheStorage {
    // Creation order is lookup order.
    stores: RwLock<Vec<Arc<MemoryStore>>>,
}

impl MemoryCacheStorage {
    /// Creates an empty storage with no stores.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn CacheStore>, CacheError>> {
        Box::pin(async move {
            validate_store_name(name)?;
            let mut stores = self.stores.write().await;
            if let Some(store) = stores.iter().find(|s| s.name == name) {
                return Ok(Arc::clone(store) as Arc<dyn CacheStore>);
            }

            debug!(store = name, "creating in-memory cache store");
            let store = Arc::new(MemoryStore::new(name));
            stores.push(Arc::clone(&store));
            Ok(store as Arc<dyn CacheStore>)
        })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn CacheStore>>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .stores
                .read()
                .await
                .iter()
                .find(|s| s.name == name)
                .map(|s| Arc::clone(s) as Arc<dyn CacheStore>))
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { Ok(self.stores.read().await.iter().any(|s| s.name == name)) })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            let mut stores = self.stores.write().await;
            let before = stores.len();
            stores.retain(|s| s.name != name);
            Ok(stores.len() < before)
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .stores
                .read()
                .await
                .iter()
                .map(|s| s.name.clone())
                .collect())
        })
    }
}

/// A single in-memory store. Obtained through [`MemoryCacheStorage::open`].
pub struct MemoryStore {
    name: String,
    entries: RwLock<BTreeMap<CacheKey, StoredResponse>>,
}

impl MemoryStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_request<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
        Box::pin(async move {
            let key = CacheKey::from_request(request);
            self.entries
                .read()
                .await
                .get(&key)
                .map(StoredResponse::to_response)
                .transpose()
        })
    }

    fn put<'a>(
        &'a self,
        request: &'a Request,
        response: Response,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let key = CacheKey::from_request(request);
            let entry = StoredResponse::capture(request, response)?;
            self.entries.write().await.insert(key, entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            let key = CacheKey::from_request(request);
            Ok(self.entries.write().await.remove(&key).is_some())
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
        Box::pin(async move { Ok(self.entries.read().await.keys().cloned().collect()) })
    }
}
