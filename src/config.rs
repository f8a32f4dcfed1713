//! Configuration for the interceptor, the network client and the proxy host.
//!
//! Everything deserializes from JSON with `serde`. Every field has a default
//! except [`ProxyConfig::upstream`]. Durations are given in milliseconds.
//!
//! ```json
//! {
//!   "listen": "127.0.0.1:8080",
//!   "upstream": "http://127.0.0.1:8000",
//!   "cache_dir": "./cache",
//!   "cache": { "store_name": "v1" },
//!   "fetcher": { "connect_timeout_ms": 5000, "request_timeout_ms": 30000 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Name of the store the interceptor writes to when none is configured.
pub const DEFAULT_STORE_NAME: &str = "v1";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid upstream URL {url:?}: {source}")]
    Upstream {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("upstream must be an http:// or https:// URL, got {0}")]
    UpstreamScheme(String),
}

/// Interceptor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version label of the store that misses are written to.
    pub store_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_name: DEFAULT_STORE_NAME.to_owned(),
        }
    }
}

impl CacheConfig {
    /// Creates a config that writes to `store_name`.
    pub fn with_store_name(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
        }
    }
}

/// Network client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub connect_timeout_ms: u64,
    /// Upper bound for one whole exchange, connect included.
    pub request_timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

impl FetcherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings for the proxy host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Origin that origin-form request targets are resolved against.
    pub upstream: String,

    /// Directory for the file-backed cache. `None` keeps the cache in memory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub fetcher: FetcherConfig,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_owned()
}

impl ProxyConfig {
    /// Creates a config with defaults for everything but the upstream.
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            listen: default_listen(),
            upstream: upstream.into(),
            cache_dir: None,
            cache: CacheConfig::default(),
            fetcher: FetcherConfig::default(),
        }
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if the document is malformed or lacks `upstream`.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not a valid config.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates the upstream origin.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Upstream`] if it does not parse, [`ConfigError::UpstreamScheme`]
    /// if it is neither `http://` nor `https://`.
    pub fn upstream_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.upstream).map_err(|source| ConfigError::Upstream {
            url: self.upstream.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UpstreamScheme(self.upstream.clone()));
        }
        Ok(url)
    }
}
