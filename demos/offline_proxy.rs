//! Caching reverse proxy in front of a local dev server.
//!
//! ```text
//! cargo run --example offline_proxy -- cachefront.json
//! ```
//!
//! Upstreams may be `http://` or `https://`. Without a config path it proxies
//! `http://127.0.0.1:8000` on `127.0.0.1:8080` and keeps the cache in memory.
//! Once a resource has been loaded through the proxy, it keeps being served
//! after the upstream stops.

use std::sync::Arc;

use cachefront::cache::{CacheStorage, FileCacheStorage, MemoryCacheStorage};
use cachefront::config::ProxyConfig;
use cachefront::interceptor::CacheFirst;
use cachefront::network::ReqwestFetcher;
use cachefront::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cachefront=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::load(path).await?,
        None => ProxyConfig::new("http://127.0.0.1:8000"),
    };
    let upstream = config.upstream_url()?;

    let caches: Arc<dyn CacheStorage> = match &config.cache_dir {
        Some(dir) => Arc::new(FileCacheStorage::new(dir)),
        None => Arc::new(MemoryCacheStorage::new()),
    };
    let interceptor = Arc::new(CacheFirst::new(
        caches,
        Arc::new(ReqwestFetcher::new(&config.fetcher)?),
        config.cache.clone(),
    ));

    let server = Server::bind(&config.listen, upstream).await?;
    println!(
        "Proxying {} on http://{} (store {:?})",
        server.upstream(),
        server.local_addr(),
        interceptor.config().store_name
    );

    server
        .run_until(Arc::clone(&interceptor), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    interceptor.flush().await;
    let stats = interceptor.stats();
    println!(
        "hits={} misses={} network_failures={}",
        stats.hits, stats.misses, stats.network_failures
    );
    Ok(())
}
