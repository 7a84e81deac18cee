//! Version Sweeper: deletes caches left behind by earlier versions.

use tracing::info;

use crate::cache::SharedCacheStorage;

/// Deletes every cache whose name is not the current version's.
pub struct VersionSweeper {
    cache_name: String,
    caches: SharedCacheStorage,
}

impl VersionSweeper {
    /// Create a sweeper that keeps only `cache_name`.
    pub fn new(cache_name: impl Into<String>, caches: SharedCacheStorage) -> Self {
        Self {
            cache_name: cache_name.into(),
            caches,
        }
    }

    /// Delete stale caches. Returns the deleted names, sorted.
    pub async fn sweep(&self) -> Vec<String> {
        let mut caches = self.caches.write().await;

        let stale: Vec<String> = caches
            .keys()
            .into_iter()
            .filter(|name| *name != self.cache_name)
            .collect();

        for name in &stale {
            caches.delete(name);
            info!(cache = %name, current = %self.cache_name, "Deleted stale cache");
        }

        stale
    }
}
