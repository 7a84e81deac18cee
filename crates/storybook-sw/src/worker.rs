//! One worker version and its lifecycle.
//!
//! ```text
//! Parsed → Installing → Installed → Activating → Activated
//!              │                         │
//!              └────────→ Redundant ←────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storybook_common::OfflineConfig;
use storybook_net::{Fetcher, Request};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::SharedCacheStorage;
use crate::install::{InstallCoordinator, InstallReport};
use crate::router::{RequestRouter, RouteDecision};
use crate::sweep::VersionSweeper;
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Replaced, or install/activate failed.
    Redundant,
}

/// A service worker for one version of the site.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: Arc<OfflineConfig>,
    state: watch::Sender<ServiceWorkerState>,
    caches: SharedCacheStorage,
    installer: InstallCoordinator,
    sweeper: VersionSweeper,
    router: RequestRouter,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}

impl ServiceWorker {
    /// Create a worker for a validated configuration.
    pub fn new(
        config: OfflineConfig,
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let installer = InstallCoordinator::new(&config, caches.clone(), fetcher.clone())?;
        let sweeper = VersionSweeper::new(config.cache_name(), caches.clone());
        let router = RequestRouter::new(&config, caches.clone(), fetcher)?;
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);

        Ok(Self {
            id: ServiceWorkerId::new(),
            config: Arc::new(config),
            state,
            caches,
            installer,
            sweeper,
            router,
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn cache_name(&self) -> String {
        self.config.cache_name()
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state() == ServiceWorkerState::Redundant
    }

    fn set_state(&self, state: ServiceWorkerState) {
        let previous = self.state.send_replace(state);
        debug!(worker = self.id.raw(), version = %self.config.version, from = ?previous, to = ?state, "State change");
    }

    fn expect_state(&self, expected: ServiceWorkerState) -> Result<(), ServiceWorkerError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(ServiceWorkerError::StateError(format!(
                "worker {} is {:?}, expected {:?}",
                self.id.raw(),
                state,
                expected
            )))
        }
    }

    /// Handle the install event.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.expect_state(ServiceWorkerState::Parsed)?;
        self.set_state(ServiceWorkerState::Installing);

        match self.installer.install().await {
            Ok(report) => {
                self.set_state(ServiceWorkerState::Installed);
                Ok(report)
            }
            Err(err) => {
                warn!(version = %self.config.version, error = %err, "Install failed");
                self.set_state(ServiceWorkerState::Redundant);
                Err(err)
            }
        }
    }

    /// Handle the activate event: sweep stale caches. Returns the deleted
    /// cache names.
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.expect_state(ServiceWorkerState::Installed)?;
        self.set_state(ServiceWorkerState::Activating);

        let deleted = self.sweeper.sweep().await;

        self.set_state(ServiceWorkerState::Activated);
        info!(version = %self.config.version, swept = deleted.len(), "Worker activated");
        Ok(deleted)
    }

    /// Bring a worker straight to `Activated` over caches restored from a
    /// previous run, without fetching anything. Returns the cache names the
    /// sweep deleted.
    ///
    /// Fails if this version's cache is missing any precache entry; the
    /// caller should then install normally.
    pub async fn resume(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.expect_state(ServiceWorkerState::Parsed)?;

        let cache_name = self.cache_name();
        {
            let caches = self.caches.read().await;
            let cache = caches.get(&cache_name).ok_or_else(|| {
                ServiceWorkerError::StateError(format!("no cache named {cache_name}"))
            })?;
            if let Some(missing) = self
                .installer
                .precache()
                .iter()
                .find(|url| cache.match_url(url).is_none())
            {
                return Err(ServiceWorkerError::StateError(format!(
                    "{cache_name} is missing {missing}"
                )));
            }
        }

        self.set_state(ServiceWorkerState::Installed);
        self.activate().await
    }

    /// Handle a fetch event.
    ///
    /// A worker that was activated keeps finishing fetches handed to it
    /// after it has been replaced.
    pub async fn fetch(&self, request: &Request) -> Result<RouteDecision, ServiceWorkerError> {
        match self.state() {
            ServiceWorkerState::Activated | ServiceWorkerState::Redundant => {
                self.router.route(request).await
            }
            state => Err(ServiceWorkerError::StateError(format!(
                "worker {} cannot handle fetches while {:?}",
                self.id.raw(),
                state
            ))),
        }
    }

    /// Mark the worker as replaced.
    pub fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant);
    }
}
