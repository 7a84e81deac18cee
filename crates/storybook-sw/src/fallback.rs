//! Offline Fallback Resolver.

use storybook_net::Response;
use url::Url;

use crate::cache::SharedCacheStorage;

/// Looks up the precached offline document in the current version's cache.
pub struct OfflineFallback {
    offline_url: Url,
    cache_name: String,
    caches: SharedCacheStorage,
}

impl OfflineFallback {
    pub fn new(offline_url: Url, cache_name: impl Into<String>, caches: SharedCacheStorage) -> Self {
        Self {
            offline_url,
            cache_name: cache_name.into(),
            caches,
        }
    }

    /// URL of the offline document.
    pub fn offline_url(&self) -> &Url {
        &self.offline_url
    }

    /// The offline document, or `None` if it is not in the cache.
    pub async fn resolve(&self) -> Option<Response> {
        let caches = self.caches.read().await;
        caches
            .get(&self.cache_name)?
            .match_url(&self.offline_url)
            .map(|entry| entry.to_response())
    }
}
