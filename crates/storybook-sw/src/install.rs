//! Install Coordinator: precaches the app shell.

use std::sync::Arc;

use futures::future::join_all;
use storybook_common::OfflineConfig;
use storybook_net::{FetchOutcome, Fetcher, Request};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SharedCacheStorage;
use crate::ServiceWorkerError;

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Cache that received the precache list.
    pub cache_name: String,
    /// Number of entries written.
    pub cached: usize,
    /// Whether the new version should activate without waiting for old
    /// clients to close.
    pub skip_waiting: bool,
}

/// Writes every precache URL into the current version's cache.
pub struct InstallCoordinator {
    cache_name: String,
    precache: Vec<Url>,
    skip_waiting: bool,
    caches: SharedCacheStorage,
    fetcher: Arc<dyn Fetcher>,
}

impl InstallCoordinator {
    /// Create a coordinator. The configuration must validate.
    pub fn new(
        config: &OfflineConfig,
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        Ok(Self {
            cache_name: config.cache_name(),
            precache: config.precache_urls()?,
            skip_waiting: config.skip_waiting,
            caches,
            fetcher,
        })
    }

    /// Precache URLs, in configuration order.
    pub fn precache(&self) -> &[Url] {
        &self.precache
    }

    /// Run the install.
    ///
    /// All assets are fetched before anything is written. A network error or
    /// a non-2xx status for any asset fails the whole install and leaves the
    /// cache contents untouched.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        // Opening creates the cache even if the fetches below fail.
        self.caches.write().await.open(&self.cache_name);

        info!(
            cache = %self.cache_name,
            assets = self.precache.len(),
            "Caching app assets"
        );

        let fetches = self.precache.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let outcome = self.fetcher.fetch(&request).await;
            (request, outcome)
        });

        let mut staged = Vec::with_capacity(self.precache.len());
        for (request, outcome) in join_all(fetches).await {
            let reason = match outcome {
                FetchOutcome::Success(response) => {
                    debug!(url = %request.url, status = %response.status, "Precache fetch ok");
                    staged.push((request, response));
                    continue;
                }
                FetchOutcome::HttpError(response) => format!("HTTP {}", response.status),
                FetchOutcome::NetworkError(err) => err.to_string(),
            };

            warn!(url = %request.url, reason = %reason, "Precache fetch failed");
            return Err(ServiceWorkerError::InstallFailed {
                url: request.url.to_string(),
                reason,
            });
        }

        let mut caches = self.caches.write().await;
        let cache = caches.open(&self.cache_name);
        for (request, response) in &staged {
            cache.put(request, response);
        }

        info!(cache = %self.cache_name, cached = staged.len(), "App assets cached");

        Ok(InstallReport {
            cache_name: self.cache_name.clone(),
            cached: staged.len(),
            skip_waiting: self.skip_waiting,
        })
    }
}
