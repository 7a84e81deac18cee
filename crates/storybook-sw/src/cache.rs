//! Cache Storage: named caches of request/response snapshots.
//!
//! ```text
//! CacheStorage
//!     ├── "storybook-v1" (Cache)
//!     │       └── request key → CacheEntry
//!     └── "storybook-v2" (Cache)
//! ```
//!
//! Entries are never patched in place; `put` replaces the whole entry.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use storybook_net::{cache_key, Request, Response};
use tokio::sync::RwLock;
use url::Url;

/// Cache storage shared between the installer, the sweeper and concurrent
/// fetch handlers.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Snapshot of one response, keyed by the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request key (URL without fragment).
    pub url: String,

    /// Method of the request that was stored (always GET in practice).
    pub method: String,

    /// Response URL after redirects.
    pub response_url: Url,

    /// HTTP status of the stored response.
    pub status: u16,

    /// Headers of the stored response in received order, one pair per
    /// value; non-UTF-8 values are dropped.
    pub headers: Vec<(String, String)>,

    pub body: Bytes,

    /// Whether the response was produced by a redirect.
    pub redirected: bool,

    /// Milliseconds since the Unix epoch at the time of `put`.
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    pub fn new(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.cache_key(),
            method: request.method.to_string(),
            response_url: response.url.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body().clone(),
            redirected: response.redirected,
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        // Statuses are checked when snapshots are loaded from disk.
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        let mut response = Response::new(self.response_url.clone(), status, self.body.clone())
            .with_redirected(self.redirected);
        response.headers = headers;
        response
    }
}

/// One named cache, e.g. `storybook-v1`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub name: String,

    /// Keyed by URL without fragment.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests can match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries.get(&request.cache_key())
    }

    /// Match a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(url))
    }

    /// Store a response for a request, replacing any previous entry.
    pub fn put(&mut self, request: &Request, response: &Response) {
        let entry = CacheEntry::new(request, response);
        self.entries.insert(entry.url.clone(), entry);
    }

    /// Remove the entry for `url`. Returns whether one existed.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// All entries.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache storage (the set of named caches).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap for sharing across tasks.
    pub fn shared(self) -> SharedCacheStorage {
        Arc::new(RwLock::new(self))
    }

    /// Get a cache by name, creating it empty if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get an existing cache.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Get an existing cache for writing.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Whether a cache named `name` exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Drop a whole cache. Returns whether it existed.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn caches(&self) -> impl Iterator<Item = &Cache> {
        self.caches.values()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
