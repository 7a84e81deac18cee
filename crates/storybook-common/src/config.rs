//! Worker configuration
//!
//! Everything that would otherwise be a module-level constant in a worker
//! script (cache name, precache list, offline document) lives here and is
//! passed explicitly to the components that need it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Cache name prefix; the full name is `<prefix>-<version>`.
pub const DEFAULT_CACHE_PREFIX: &str = "storybook";

/// Offline document served when navigations fail.
pub const DEFAULT_OFFLINE_PATH: &str = "offline.html";

const DEFAULT_SCOPE: &str = "http://localhost:8000/";

const DEFAULT_PRECACHE: &[&str] = &[
    "./",
    "./index.html",
    "./about.html",
    "./portfolio.html",
    "./pricing.html",
    "./faq.html",
    "./contact.html",
    "./css/styles.css",
    "./js/main.js",
    "./js/components.js",
    "./offline.html",
    "./manifest.json",
];

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Precache list is empty")]
    EmptyPrecacheList,

    #[error("Cache version is empty")]
    EmptyVersion,

    #[error("Invalid URL {path}: {reason}")]
    InvalidUrl { path: String, reason: String },

    #[error("Cross-origin precache entry: {0}")]
    CrossOrigin(String),

    #[error("Duplicate precache entry: {0}")]
    DuplicateEntry(String),

    #[error("Offline document {0} is not in the precache list")]
    MissingOfflineDocument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Offline worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Cache name prefix.
    pub cache_prefix: String,

    /// Version tag. Must change on every deploy that changes precached content.
    pub version: String,

    /// Worker scope; precache paths resolve against it.
    pub scope: Url,

    /// Offline document path, relative to the scope.
    pub offline_path: String,

    /// App shell paths, relative to the scope.
    pub precache: Vec<String>,

    /// Activate a freshly installed version without waiting for pages
    /// controlled by the previous version to close.
    pub skip_waiting: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            version: "v1".to_string(),
            scope: Url::parse(DEFAULT_SCOPE).expect("default scope is a valid URL"),
            offline_path: DEFAULT_OFFLINE_PATH.to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
            skip_waiting: true,
        }
    }
}

impl OfflineConfig {
    /// Create the default configuration for a different scope.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Set the version tag.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set whether installs skip the waiting phase.
    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Replace the precache list.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Name of the cache store owned by this version.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Resolve a scope-relative path to an absolute URL without fragment.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        let mut url = self.scope.join(path).map_err(|e| ConfigError::InvalidUrl {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        url.set_fragment(None);
        Ok(url)
    }

    /// Absolute URLs of the precache list, in order.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Absolute URL of the offline document.
    pub fn offline_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.offline_path)
    }

    /// Whether a URL shares the scope's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        let origin = self.scope.origin();
        origin.is_tuple() && url.origin() == origin
    }

    /// Check the configuration before a worker is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::EmptyVersion);
        }
        if !self.scope.origin().is_tuple() {
            return Err(ConfigError::InvalidUrl {
                path: self.scope.to_string(),
                reason: "scope has no network origin".to_string(),
            });
        }
        if self.precache.is_empty() {
            return Err(ConfigError::EmptyPrecacheList);
        }

        let mut seen = HashSet::new();
        for url in self.precache_urls()? {
            if !self.is_same_origin(&url) {
                return Err(ConfigError::CrossOrigin(url.to_string()));
            }
            if !seen.insert(url.to_string()) {
                return Err(ConfigError::DuplicateEntry(url.to_string()));
            }
        }

        let offline = self.offline_url()?;
        if !seen.contains(offline.as_str()) {
            return Err(ConfigError::MissingOfflineDocument(offline.to_string()));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration.
    ///
    /// Missing fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        if let Err(err) = config.validate() {
            warn!(version = %config.version, error = %err, "Rejected worker configuration");
            return Err(err);
        }
        debug!(cache = %config.cache_name(), assets = config.precache.len(), "Parsed worker configuration");
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            warn!(path = %path.display(), error = %err, "Cannot read worker configuration");
            err
        })?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), cache = %config.cache_name(), "Loaded worker configuration");
        Ok(config)
    }
}
