//! # Storybook Service Worker
//!
//! Offline caching layer for the Storybook site, modelled as an installable
//! worker that intercepts page requests.
//!
//! ## Features
//!
//! - **Precache**: the app shell is fetched and stored atomically on install
//! - **Version sweep**: caches from earlier versions are deleted on activate
//! - **Routing**: cache-first for sub-resources, network-first for navigations
//! - **Offline fallback**: a precached offline document when the network fails
//! - **Persistence**: cache storage snapshots survive a host restart
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │               ├── InstallCoordinator
//!     │               ├── VersionSweeper
//!     │               └── RequestRouter
//!     │                       └── OfflineFallback
//!     ├── Clients
//!     └── CacheStorage
//!             └── Cache ("storybook-v1")
//!                     └── Request → Response
//! ```

use storybook_common::ConfigError;
use storybook_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod fallback;
pub mod host;
pub mod install;
pub mod persist;
pub mod router;
pub mod sweep;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, SharedCacheStorage};
pub use fallback::OfflineFallback;
pub use host::{dispatch, Client, ClientId, HostEvent, Registration, ServiceWorkerHost, WorkerEvent};
pub use install::{InstallCoordinator, InstallReport};
pub use router::{RequestRouter, ResponseSource, RouteDecision, RoutedResponse};
pub use sweep::VersionSweeper;
pub use worker::{ServiceWorker, ServiceWorkerId, ServiceWorkerState};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker stopped before the event completed")]
    WorkerStopped,
}

impl ServiceWorkerError {
    /// Whether the error is a failure to reach the network.
    pub fn is_network_error(&self) -> bool {
        matches!(self, ServiceWorkerError::Network(_))
    }
}

impl From<serde_json::Error> for ServiceWorkerError {
    fn from(err: serde_json::Error) -> Self {
        ServiceWorkerError::Persistence(err.to_string())
    }
}
