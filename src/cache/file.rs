//! File-backed cache storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/.stores.json   {"stores": ["v1", "v2"]}          creation order
//! <root>/v1.json        {"version": 1, "entries": {...}}  one file per store
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! crash mid-write leaves the previous document intact. Store names cannot
//! start with `.`, so they never collide with the manifest.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CacheError, CacheKey, CacheStorage, CacheStore, StoredResponse, validate_store_name};
use crate::BoxFuture;
use crate::http::{Request, Response};

const MANIFEST_FILE: &str = ".stores.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    stores: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    entries: BTreeMap<CacheKey, StoredResponse>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    entries: &'a BTreeMap<CacheKey, StoredResponse>,
}

#[derive(Default)]
struct State {
    // `None` until the manifest has been read from disk.
    manifest: Option<Manifest>,
    open: HashMap<String, Arc<FileStore>>,
}

/// [`CacheStorage`] persisted as JSON documents in a directory.
///
/// Entries survive process restarts. The directory is created on the first
/// `open`.
///
/// # Examples
///
/// ```rust,no_run
/// use cachefront::cache::{CacheStorage, FileCacheStorage};
///
/// # async fn demo() -> Result<(), cachefront::cache::CacheError> {
/// let caches = FileCacheStorage::new("/var/cache/cachefront");
/// let store = caches.open("v1").await?;
/// println!("{} entries", store.keys().await?.len());
/// # Ok(())
/// # }
/// ```
pub struct FileCacheStorage {
    root: PathBuf,
    state: Mutex<State>,
}

impl FileCacheStorage {
    /// Creates a storage rooted at `root`. Nothing is read until first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    async fn manifest<'s>(&self, state: &'s mut State) -> Result<&'s mut Manifest, CacheError> {
        if state.manifest.is_none() {
            let path = self.root.join(MANIFEST_FILE);
            let manifest = read_json::<Manifest>(&path).await?.unwrap_or_default();
            state.manifest = Some(manifest);
        }
        Ok(state.manifest.get_or_insert_with(Manifest::default))
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(manifest).map_err(CacheError::Encode)?;
        write_atomic(&self.root.join(MANIFEST_FILE), &bytes).await
    }

    // Reads a listed store's document and registers the handle.
    async fn load_store(&self, state: &mut State, name: &str) -> Result<Arc<FileStore>, CacheError> {
        let path = self.store_path(name);
        let entries = match read_json::<StoreDocument>(&path).await? {
            Some(doc) => doc.entries,
            None => BTreeMap::new(),
        };
        debug!(store = name, entries = entries.len(), "opened cache store");

        let store = Arc::new(FileStore {
            name: name.to_owned(),
            path,
            entries: Mutex::new(Some(entries)),
        });
        state.open.insert(name.to_owned(), Arc::clone(&store));
        Ok(store)
    }
}

impl CacheStorage for FileCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn CacheStore>, CacheError>> {
        Box::pin(async move {
            validate_store_name(name)?;
            let mut state = self.state.lock().await;
            if let Some(store) = state.open.get(name) {
                return Ok(Arc::clone(store) as Arc<dyn CacheStore>);
            }

            let manifest = self.manifest(&mut state).await?;
            if !manifest.stores.iter().any(|s| s == name) {
                manifest.stores.push(name.to_owned());
                let snapshot = Manifest {
                    stores: manifest.stores.clone(),
                };
                if let Err(e) = self.save_manifest(&snapshot).await {
                    manifest.stores.retain(|s| s != name);
                    return Err(e);
                }
                info!(store = name, root = %self.root.display(), "created cache store");
            }

            let store = self.load_store(&mut state, name).await?;
            Ok(store as Arc<dyn CacheStore>)
        })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn CacheStore>>, CacheError>> {
        Box::pin(async move {
            validate_store_name(name)?;
            let mut state = self.state.lock().await;
            if let Some(store) = state.open.get(name) {
                return Ok(Some(Arc::clone(store) as Arc<dyn CacheStore>));
            }
            if !self.manifest(&mut state).await?.stores.iter().any(|s| s == name) {
                return Ok(None);
            }

            let store = self.load_store(&mut state, name).await?;
            Ok(Some(store as Arc<dyn CacheStore>))
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let manifest = self.manifest(&mut state).await?;
            Ok(manifest.stores.iter().any(|s| s == name))
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let manifest = self.manifest(&mut state).await?;
            let Some(index) = manifest.stores.iter().position(|s| s == name) else {
                return Ok(false);
            };
            manifest.stores.remove(index);
            let snapshot = Manifest {
                stores: manifest.stores.clone(),
            };
            if let Err(e) = self.save_manifest(&snapshot).await {
                manifest.stores.insert(index, name.to_owned());
                return Err(e);
            }

            // Handles still held elsewhere (in-flight writes) must not
            // recreate the file below.
            if let Some(store) = state.open.remove(name) {
                store.entries.lock().await.take();
            }

            let path = self.store_path(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CacheError::Io {
                        path: path.display().to_string(),
                        source,
                    });
                }
            }
            info!(store = name, "deleted cache store");
            Ok(true)
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(self.manifest(&mut state).await?.stores.clone())
        })
    }
}

/// A single file-backed store. Obtained through [`FileCacheStorage::open`].
pub struct FileStore {
    name: String,
    path: PathBuf,
    // Held across the disk write, which serializes concurrent puts.
    // `None` once the store has been deleted from its storage.
    entries: Mutex<Option<BTreeMap<CacheKey, StoredResponse>>>,
}

impl FileStore {
    async fn persist(&self, entries: &BTreeMap<CacheKey, StoredResponse>) -> Result<(), CacheError> {
        let doc = StoreDocumentRef {
            version: FORMAT_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec(&doc).map_err(CacheError::Encode)?;
        write_atomic(&self.path, &bytes).await
    }

    fn deleted(&self) -> CacheError {
        CacheError::StoreDeleted {
            name: self.name.clone(),
        }
    }
}

impl CacheStore for FileStore {
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
                .lock()
                .await
                .as_ref()
                .and_then(|entries| entries.get(&key))
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

            let mut guard = self.entries.lock().await;
            let Some(entries) = guard.as_mut() else {
                return Err(self.deleted());
            };
            let previous = entries.insert(key.clone(), entry);
            if let Err(e) = self.persist(entries).await {
                // Keep memory in line with what is on disk.
                match previous {
                    Some(previous) => entries.insert(key, previous),
                    None => entries.remove(&key),
                };
                return Err(e);
            }
            debug!(store = %self.name, key = %key, "persisted cache entry");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            let key = CacheKey::from_request(request);
            let mut guard = self.entries.lock().await;
            let Some(entries) = guard.as_mut() else {
                return Ok(false);
            };
            let Some(previous) = entries.remove(&key) else {
                return Ok(false);
            };
            if let Err(e) = self.persist(entries).await {
                entries.insert(key, previous);
                return Err(e);
            }
            Ok(true)
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .await
                .as_ref()
                .map(|entries| entries.keys().cloned().collect())
                .unwrap_or_default())
        })
    }
}

// Reads and decodes a JSON file; `Ok(None)` if it does not exist.
async fn read_json<T>(path: &Path) -> Result<Option<T>, CacheError>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CacheError::Corrupt {
            path: path.display().to_string(),
            source,
        })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn request(path: &str) -> Request {
        Request::get(&format!("http://localhost:8000{path}")).unwrap()
    }

    #[tokio::test]
    async fn entries_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("/app.js");

        {
            let caches = FileCacheStorage::new(dir.path());
            let store = caches.open("v1").await.unwrap();
            store
                .put(
                    &req,
                    Response::new(StatusCode::OK)
                        .header("Content-Type", "text/javascript")
                        .body("console.log(1)"),
                )
                .await
                .unwrap();
        }

        let caches = FileCacheStorage::new(dir.path());
        assert_eq!(caches.keys().await.unwrap(), vec!["v1".to_owned()]);
        let mut hit = caches.match_request(&req).await.unwrap().unwrap();
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(hit.headers().get("content-type"), Some("text/javascript"));
        assert_eq!(hit.text().unwrap(), "console.log(1)");
    }

    #[tokio::test]
    async fn lookup_on_empty_directory_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let caches = FileCacheStorage::new(dir.path().join("cache"));
        assert!(caches.match_request(&request("/")).await.unwrap().is_none());
        assert!(!dir.path().join("cache").exists());
    }

    #[tokio::test]
    async fn store_file_is_written_on_first_put() {
        let dir = tempfile::tempdir().unwrap();
        let caches = FileCacheStorage::new(dir.path());
        let store = caches.open("v1").await.unwrap();
        assert!(!dir.path().join("v1.json").exists());

        store
            .put(&request("/a"), Response::new(StatusCode::OK).body("a"))
            .await
            .unwrap();
        assert!(dir.path().join("v1.json").exists());
        assert!(!dir.path().join("v1.json.tmp").exists());

        let raw = std::fs::read_to_string(dir.path().join("v1.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], 1);
        assert!(doc["entries"]["http://localhost:8000/a"].is_object());
    }

    #[tokio::test]
    async fn delete_removes_store_file_and_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let caches = FileCacheStorage::new(dir.path());
        caches
            .open("v1")
            .await
            .unwrap()
            .put(&request("/a"), Response::new(StatusCode::OK).body("a"))
            .await
            .unwrap();

        assert!(caches.delete("v1").await.unwrap());
        assert!(!dir.path().join("v1.json").exists());
        assert!(!caches.has("v1").await.unwrap());

        let reopened = FileCacheStorage::new(dir.path());
        assert!(reopened.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_through_a_stale_handle_do_not_revive_a_deleted_store() {
        let dir = tempfile::tempdir().unwrap();
        let caches = FileCacheStorage::new(dir.path());
        let req = request("/app.js");
        let stale = caches.open("v1").await.unwrap();
        stale
            .put(&req, Response::new(StatusCode::OK).body("old"))
            .await
            .unwrap();

        assert!(caches.delete("v1").await.unwrap());
        assert!(matches!(
            stale
                .put(&req, Response::new(StatusCode::OK).body("late"))
                .await,
            Err(CacheError::StoreDeleted { .. })
        ));
        assert!(stale.match_request(&req).await.unwrap().is_none());
        assert!(!dir.path().join("v1.json").exists());

        let reopened = caches.open("v1").await.unwrap();
        assert!(reopened.match_request(&req).await.unwrap().is_none());
        assert!(caches.match_request(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_loads_listed_stores_without_creating_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("/a");
        FileCacheStorage::new(dir.path())
            .open("v1")
            .await
            .unwrap()
            .put(&req, Response::new(StatusCode::OK).body("a"))
            .await
            .unwrap();

        let caches = FileCacheStorage::new(dir.path());
        let store = caches.get("v1").await.unwrap().unwrap();
        let mut hit = store.match_request(&req).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "a");

        assert!(caches.get("v2").await.unwrap().is_none());
        assert_eq!(caches.keys().await.unwrap(), vec!["v1".to_owned()]);
        assert!(!dir.path().join("v2.json").exists());
    }

    #[tokio::test]
    async fn corrupt_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"stores":["v1"]}"#).unwrap();
        std::fs::write(dir.path().join("v1.json"), "not json").unwrap();

        let caches = FileCacheStorage::new(dir.path());
        assert!(matches!(
            caches.match_request(&request("/a")).await,
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn store_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("/a");
        {
            let caches = FileCacheStorage::new(dir.path());
            let store = caches.open("v1").await.unwrap();
            store
                .put(&req, Response::new(StatusCode::OK).body("a"))
                .await
                .unwrap();
            assert!(store.delete(&req).await.unwrap());
        }
        let caches = FileCacheStorage::new(dir.path());
        assert!(caches.match_request(&req).await.unwrap().is_none());
    }
}
