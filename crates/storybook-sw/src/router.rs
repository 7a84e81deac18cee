//! Request Router: decides how each intercepted request is answered.
//!
//! | Request                          | Policy                                   |
//! |----------------------------------|------------------------------------------|
//! | foreign origin, or not GET       | pass through, cache untouched            |
//! | navigation                       | network first, offline document on error |
//! | same-origin sub-resource         | cache first, store basic 200s            |
//!
//! Only a network error triggers the offline document. A received 404 or 500
//! is returned as it is.

use std::sync::Arc;

use http::Method;
use storybook_common::OfflineConfig;
use storybook_net::{FetchOutcome, Fetcher, NetError, Request, Response};
use tracing::{debug, trace, warn};
use url::{Origin, Url};

use crate::cache::SharedCacheStorage;
use crate::fallback::OfflineFallback;
use crate::ServiceWorkerError;

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

/// A response produced by the router.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl RoutedResponse {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    /// Whether the response was served from the cache.
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// Routing decision for one request.
#[derive(Debug)]
pub enum RouteDecision {
    /// Not intercepted; the request goes to the network untouched.
    PassThrough,
    /// Answered by the worker.
    Respond(RoutedResponse),
}

impl RouteDecision {
    /// The routed response, if the request was intercepted.
    pub fn into_routed(self) -> Option<RoutedResponse> {
        match self {
            RouteDecision::PassThrough => None,
            RouteDecision::Respond(routed) => Some(routed),
        }
    }
}

/// Applies the caching policy to intercepted requests.
pub struct RequestRouter {
    origin: Origin,
    cache_name: String,
    caches: SharedCacheStorage,
    fetcher: Arc<dyn Fetcher>,
    fallback: OfflineFallback,
}

impl RequestRouter {
    /// Create a router for one worker version.
    pub fn new(
        config: &OfflineConfig,
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let cache_name = config.cache_name();
        let fallback = OfflineFallback::new(config.offline_url()?, &cache_name, caches.clone());
        Ok(Self {
            origin: config.scope.origin(),
            cache_name,
            caches,
            fetcher,
            fallback,
        })
    }

    /// Whether the router handles this request at all.
    pub fn intercepts(&self, request: &Request) -> bool {
        request.method == Method::GET && self.is_same_origin(&request.url)
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        self.origin.is_tuple() && url.origin() == self.origin
    }

    /// Route a request.
    ///
    /// Errors are network errors the router could not recover from: a failed
    /// sub-resource fetch that does not accept HTML, or any failed fetch
    /// when the offline document is missing.
    pub async fn route(&self, request: &Request) -> Result<RouteDecision, ServiceWorkerError> {
        if !self.intercepts(request) {
            trace!(url = %request.url, method = %request.method, "Passing request through");
            return Ok(RouteDecision::PassThrough);
        }

        let routed = if request.is_navigation() {
            self.network_first(request).await?
        } else {
            self.cache_first(request).await?
        };

        debug!(url = %request.url, source = ?routed.source, status = %routed.response.status, "Routed request");
        Ok(RouteDecision::Respond(routed))
    }

    /// Navigations: always try the network; responses are not cached.
    async fn network_first(&self, request: &Request) -> Result<RoutedResponse, ServiceWorkerError> {
        match self.fetcher.fetch(request).await {
            FetchOutcome::Success(response) | FetchOutcome::HttpError(response) => {
                Ok(RoutedResponse::new(response, ResponseSource::Network))
            }
            FetchOutcome::NetworkError(err) => self.fall_back(request, err).await,
        }
    }

    /// Sub-resources: serve from cache, otherwise fetch and store.
    async fn cache_first(&self, request: &Request) -> Result<RoutedResponse, ServiceWorkerError> {
        if let Some(cached) = self.lookup(request).await {
            trace!(url = %request.url, "Cache hit");
            return Ok(RoutedResponse::new(cached, ResponseSource::Cache));
        }

        match self.fetcher.fetch(request).await {
            FetchOutcome::Success(response) => {
                if response.is_cacheable() {
                    self.store(request, &response).await;
                } else {
                    trace!(url = %request.url, response_type = ?response.response_type, "Response not cacheable");
                }
                Ok(RoutedResponse::new(response, ResponseSource::Network))
            }
            FetchOutcome::HttpError(response) => {
                Ok(RoutedResponse::new(response, ResponseSource::Network))
            }
            FetchOutcome::NetworkError(err) if request.accepts_html() => {
                self.fall_back(request, err).await
            }
            FetchOutcome::NetworkError(err) => Err(err.into()),
        }
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        caches
            .get(&self.cache_name)?
            .match_request(request)
            .map(|entry| entry.to_response())
    }

    async fn store(&self, request: &Request, response: &Response) {
        // A swept cache is not recreated by requests still in flight on an
        // outgoing version.
        let mut caches = self.caches.write().await;
        match caches.get_mut(&self.cache_name) {
            Some(cache) => {
                cache.put(request, response);
                trace!(url = %request.url, cache = %self.cache_name, "Stored response");
            }
            None => debug!(url = %request.url, cache = %self.cache_name, "Cache gone, not storing"),
        }
    }

    async fn fall_back(
        &self,
        request: &Request,
        err: NetError,
    ) -> Result<RoutedResponse, ServiceWorkerError> {
        match self.fallback.resolve().await {
            Some(document) => {
                warn!(url = %request.url, error = %err, "Network failed, serving offline document");
                Ok(RoutedResponse::new(document, ResponseSource::OfflineFallback))
            }
            None => {
                warn!(
                    url = %request.url,
                    offline = %self.fallback.offline_url(),
                    "Offline document not cached"
                );
                Err(err.into())
            }
        }
    }
}
