//! In-memory fetcher.
//!
//! Serves a fixed route table keyed by URL. Unknown URLs get a 404, the way
//! a static file server would answer. The whole fetcher can be switched
//! offline, and every attempt is recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tokio::sync::Mutex;
use tracing::trace;
use url::Url;

use crate::{cache_key, FetchOutcome, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Fail,
}

/// Fetcher backed by an in-memory route table.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: HashMap<String, Route>,
    offline: AtomicBool,
    fetch_count: AtomicUsize,
    log: Mutex<Vec<Url>>,
}

impl MemoryFetcher {
    /// Create an empty fetcher. Every URL answers 404 until routes are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 at `url`.
    pub fn with_page(self, url: &Url, body: impl Into<Bytes>) -> Self {
        let response = Response::ok_with(url.clone(), body);
        self.with_response(url, response)
    }

    /// Serve a prepared response at `url`.
    pub fn with_response(mut self, url: &Url, response: Response) -> Self {
        self.routes.insert(cache_key(url), Route::Respond(response));
        self
    }

    /// Fail every fetch of `url` with a network error.
    pub fn with_network_error(mut self, url: &Url) -> Self {
        self.routes.insert(cache_key(url), Route::Fail);
        self
    }

    /// Switch the simulated network on or off.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetch attempts so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of fetch attempts for one URL.
    pub async fn fetches_for(&self, url: &Url) -> usize {
        let key = cache_key(url);
        self.log
            .lock()
            .await
            .iter()
            .filter(|u| cache_key(u) == key)
            .count()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, request: &Request) -> FetchOutcome {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.log.lock().await.push(request.url.clone());

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %request.url, "Offline, failing fetch");
            return FetchOutcome::NetworkError(NetError::Offline);
        }

        match self.routes.get(&request.cache_key()) {
            Some(Route::Respond(response)) => FetchOutcome::from_response(response.clone()),
            Some(Route::Fail) => FetchOutcome::NetworkError(NetError::ConnectionFailed(
                request.url.to_string(),
            )),
            None => FetchOutcome::HttpError(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                Bytes::new(),
            )),
        }
    }
}
