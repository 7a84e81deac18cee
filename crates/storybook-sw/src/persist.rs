//! Saving and restoring cache storage across restarts.
//!
//! Storage is written as a single JSON document. Bodies are kept as byte
//! arrays, so binary assets survive the round trip.

use std::io::ErrorKind;
use std::path::Path;

use http::StatusCode;
use tracing::{debug, info};

use crate::cache::CacheStorage;
use crate::ServiceWorkerError;

/// Write `storage` to `path`, replacing any previous snapshot.
pub async fn save(storage: &CacheStorage, path: impl AsRef<Path>) -> Result<(), ServiceWorkerError> {
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(storage)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, json).await?;

    info!(path = %path.display(), caches = storage.keys().len(), "Saved cache storage");
    Ok(())
}

/// Read storage from `path`. A missing file yields empty storage.
pub async fn load(path: impl AsRef<Path>) -> Result<CacheStorage, ServiceWorkerError> {
    let path = path.as_ref();

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No saved cache storage");
            return Ok(CacheStorage::new());
        }
        Err(err) => return Err(err.into()),
    };

    let storage: CacheStorage = serde_json::from_slice(&bytes)?;

    for cache in storage.caches() {
        if let Some(entry) = cache
            .entries()
            .find(|entry| StatusCode::from_u16(entry.status).is_err())
        {
            return Err(ServiceWorkerError::Persistence(format!(
                "{}: entry {} has invalid status {}",
                cache.name, entry.url, entry.status
            )));
        }
    }

    info!(path = %path.display(), caches = ?storage.keys(), "Loaded cache storage");
    Ok(storage)
}
