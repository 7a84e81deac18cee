//! Worker host: the runtime side of the worker.
//!
//! The host owns the registration slots (installing, waiting, active), the
//! controlled clients and the shared cache storage. It runs install and
//! activate one at a time and hands every fetch to the active worker.
//!
//! Events can be delivered directly through the async methods or through
//! [`ServiceWorkerHost::serve`], which takes [`WorkerEvent`]s off a channel and
//! resolves each one's completion token when handling finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use storybook_common::OfflineConfig;
use storybook_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, SharedCacheStorage};
use crate::router::RouteDecision;
use crate::worker::{ServiceWorker, ServiceWorkerId, ServiceWorkerState};
use crate::ServiceWorkerError;

// ==================== Clients ====================

/// Identifier for an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently controlling the page.
    pub controller: Option<ServiceWorkerId>,
}

// ==================== Registration ====================

/// Worker slots of the registration.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Installing worker.
    pub installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    pub active: Option<Arc<ServiceWorker>>,
}

// ==================== Events ====================

/// Notifications from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        state: ServiceWorkerState,
    },
    /// A new version failed to install.
    InstallFailed { version: String, reason: String },
    /// Stale caches were deleted on activation.
    CachesSwept { deleted: Vec<String> },
    /// A page is now controlled by a different worker.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

/// An event delivered to the host, with its completion token.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Install (and, when allowed, activate) a version.
    Install {
        config: OfflineConfig,
        done: oneshot::Sender<Result<ServiceWorkerId, ServiceWorkerError>>,
    },
    /// Activate the waiting worker, if any.
    Activate {
        done: oneshot::Sender<Result<bool, ServiceWorkerError>>,
    },
    /// Answer a page request.
    Fetch {
        request: Request,
        done: oneshot::Sender<Result<Response, ServiceWorkerError>>,
    },
}

impl WorkerEvent {
    /// Create an install event.
    pub fn install(
        config: OfflineConfig,
    ) -> (Self, oneshot::Receiver<Result<ServiceWorkerId, ServiceWorkerError>>) {
        let (done, rx) = oneshot::channel();
        (Self::Install { config, done }, rx)
    }

    /// Create an activate event.
    pub fn activate() -> (Self, oneshot::Receiver<Result<bool, ServiceWorkerError>>) {
        let (done, rx) = oneshot::channel();
        (Self::Activate { done }, rx)
    }

    /// Create a fetch event.
    pub fn fetch(request: Request) -> (Self, oneshot::Receiver<Result<Response, ServiceWorkerError>>) {
        let (done, rx) = oneshot::channel();
        (Self::Fetch { request, done }, rx)
    }
}

/// Send an event to a serving host and wait for it to complete.
pub async fn dispatch<T>(
    events: &mpsc::Sender<WorkerEvent>,
    (event, done): (WorkerEvent, oneshot::Receiver<Result<T, ServiceWorkerError>>),
) -> Result<T, ServiceWorkerError> {
    events
        .send(event)
        .await
        .map_err(|_| ServiceWorkerError::WorkerStopped)?;
    done.await.map_err(|_| ServiceWorkerError::WorkerStopped)?
}

// ==================== Host ====================

/// Hosts the worker versions of one scope.
pub struct ServiceWorkerHost {
    fetcher: Arc<dyn Fetcher>,
    caches: SharedCacheStorage,
    registration: RwLock<Registration>,
    clients: RwLock<HashMap<ClientId, Client>>,
    /// Serializes install and activate.
    lifecycle: Mutex<()>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl ServiceWorkerHost {
    /// Create a host with empty cache storage.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        Self::with_caches(fetcher, CacheStorage::new())
    }

    /// Create a host over existing cache storage (e.g. restored from disk).
    pub fn with_caches(
        fetcher: Arc<dyn Fetcher>,
        storage: CacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                fetcher,
                caches: storage.shared(),
                registration: RwLock::new(Registration::default()),
                clients: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Shared cache storage.
    pub fn caches(&self) -> SharedCacheStorage {
        Arc::clone(&self.caches)
    }

    /// Snapshot of the registration slots.
    pub async fn registration(&self) -> Registration {
        self.registration.read().await.clone()
    }

    /// The active worker.
    pub async fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.registration.read().await.active.clone()
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(HostEvent::StateChange {
            worker_id: worker.id(),
            version: worker.version().to_string(),
            state: worker.state(),
        });
    }

    /// Install a version, then activate it if it skips waiting or nothing
    /// is active yet.
    ///
    /// On failure the new worker is discarded and the active worker keeps
    /// serving.
    pub async fn register(&self, config: OfflineConfig) -> Result<Arc<ServiceWorker>, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.install_locked(config).await
    }

    /// Restart a version over caches from a previous run.
    ///
    /// If the version's cache holds the whole precache list, the worker is
    /// activated without touching the network; otherwise it is installed
    /// normally.
    pub async fn resume(&self, config: OfflineConfig) -> Result<Arc<ServiceWorker>, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let worker = Arc::new(ServiceWorker::new(
            config.clone(),
            self.caches(),
            Arc::clone(&self.fetcher),
        )?);

        match worker.resume().await {
            Ok(deleted) => {
                info!(version = %worker.version(), "Resumed from cached app shell");
                self.promote(&worker, deleted).await;
                Ok(worker)
            }
            Err(err) => {
                debug!(version = %config.version, reason = %err, "Cannot resume, installing");
                self.install_locked(config).await
            }
        }
    }

    async fn install_locked(
        &self,
        config: OfflineConfig,
    ) -> Result<Arc<ServiceWorker>, ServiceWorkerError> {
        let worker = Arc::new(ServiceWorker::new(
            config,
            self.caches(),
            Arc::clone(&self.fetcher),
        )?);

        self.emit(HostEvent::UpdateFound {
            version: worker.version().to_string(),
        });
        self.registration.write().await.installing = Some(Arc::clone(&worker));

        let result = worker.install().await;

        let (skip_waiting, active_id) = {
            let mut registration = self.registration.write().await;
            registration.installing = None;

            match result {
                Ok(ref report) => {
                    if let Some(previous) = registration.waiting.replace(Arc::clone(&worker)) {
                        previous.mark_redundant();
                    }
                    (report.skip_waiting, registration.active.as_ref().map(|w| w.id()))
                }
                Err(_) => (false, None),
            }
        };

        self.emit_state(&worker);

        if let Err(err) = result {
            self.emit(HostEvent::InstallFailed {
                version: worker.version().to_string(),
                reason: err.to_string(),
            });
            return Err(err);
        }

        if skip_waiting || !self.controls_clients(active_id).await {
            self.activate_locked().await?;
        } else {
            info!(version = %worker.version(), "Installed, waiting for clients to close");
        }

        Ok(worker)
    }

    /// Activate the waiting worker. Returns `false` if nothing was waiting.
    pub async fn activate(&self) -> Result<bool, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.activate_locked().await
    }

    async fn activate_locked(&self) -> Result<bool, ServiceWorkerError> {
        let Some(worker) = self.registration.read().await.waiting.clone() else {
            return Ok(false);
        };

        // The outgoing worker keeps the active slot until the sweep is done.
        let deleted = match worker.activate().await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(version = %worker.version(), error = %err, "Activation failed");
                self.registration.write().await.waiting = None;
                worker.mark_redundant();
                self.emit_state(&worker);
                return Err(err);
            }
        };

        self.promote(&worker, deleted).await;
        Ok(true)
    }

    /// Put an activated worker in the active slot and claim clients.
    async fn promote(&self, worker: &Arc<ServiceWorker>, deleted: Vec<String>) {
        let previous = {
            let mut registration = self.registration.write().await;
            if registration
                .waiting
                .as_ref()
                .is_some_and(|w| w.id() == worker.id())
            {
                registration.waiting = None;
            }
            registration.active.replace(Arc::clone(worker))
        };

        if let Some(previous) = previous {
            previous.mark_redundant();
            self.emit_state(&previous);
        }
        self.emit_state(worker);

        if !deleted.is_empty() {
            self.emit(HostEvent::CachesSwept { deleted });
        }

        self.claim(worker).await;
    }

    /// Make `worker` the controller of every open page in its scope.
    async fn claim(&self, worker: &ServiceWorker) {
        let scope = worker.config().scope.as_str();
        let mut clients = self.clients.write().await;

        for client in clients.values_mut() {
            if client.url.as_str().starts_with(scope) && client.controller != Some(worker.id()) {
                client.controller = Some(worker.id());
                self.emit(HostEvent::ControllerChange {
                    client_id: client.id,
                    worker_id: worker.id(),
                });
            }
        }
    }

    /// Open a page. It is controlled by the active worker if in scope.
    pub async fn open_client(&self, url: Url) -> ClientId {
        let controller = self
            .active()
            .await
            .filter(|w| url.as_str().starts_with(w.config().scope.as_str()))
            .map(|w| w.id());

        let client = Client {
            id: ClientId::new(),
            url,
            controller,
        };
        let id = client.id;
        self.clients.write().await.insert(id, client);
        id
    }

    /// Close a page.
    ///
    /// When the last page controlled by the active worker closes, a waiting
    /// worker is activated.
    pub async fn close_client(&self, id: ClientId) -> Result<bool, ServiceWorkerError> {
        if self.clients.write().await.remove(&id).is_none() {
            return Ok(false);
        }

        let registration = self.registration().await;
        if registration.waiting.is_none() {
            return Ok(true);
        }

        let active_id = registration.active.as_ref().map(|w| w.id());
        if !self.controls_clients(active_id).await {
            self.activate().await?;
        }
        Ok(true)
    }

    /// Whether any open page is controlled by `worker_id`.
    async fn controls_clients(&self, worker_id: Option<ServiceWorkerId>) -> bool {
        let Some(worker_id) = worker_id else {
            return false;
        };
        self.clients
            .read()
            .await
            .values()
            .any(|c| c.controller == Some(worker_id))
    }

    /// Open pages, ordered by id.
    pub async fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.read().await.values().cloned().collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Route a request through the active worker.
    ///
    /// Returns `PassThrough` when no worker is active or the worker does
    /// not intercept the request.
    pub async fn handle_fetch(&self, request: &Request) -> Result<RouteDecision, ServiceWorkerError> {
        match self.active().await {
            Some(worker) => worker.fetch(request).await,
            None => Ok(RouteDecision::PassThrough),
        }
    }

    /// Answer a page request: the worker's response, or the network's for
    /// requests it does not intercept.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        match self.handle_fetch(&request).await? {
            RouteDecision::Respond(routed) => Ok(routed.response),
            RouteDecision::PassThrough => {
                Ok(self.fetcher.fetch(&request).await.into_result()?)
            }
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Install { config, done } => {
                let _ = done.send(self.register(config).await.map(|w| w.id()));
            }
            WorkerEvent::Activate { done } => {
                let _ = done.send(self.activate().await);
            }
            WorkerEvent::Fetch { request, done } => {
                let _ = done.send(self.fetch(request).await);
            }
        }
    }

    /// Dispatch events until the channel closes. Each event runs on its own
    /// task; install and activate still run one at a time.
    pub async fn serve(self: Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            let host = Arc::clone(&self);
            tokio::spawn(async move { host.handle_event(event).await });
        }
        debug!("Event channel closed");
    }
}
