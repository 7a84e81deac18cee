//! # Storybook Net
//!
//! Request/response model and network access for the Storybook offline worker.
//!
//! ## Design Goals
//!
//! 1. **Tagged fetch outcomes**: a received 404 and an unreachable network are
//!    different variants, never conflated
//! 2. **Cloneable responses**: bodies are shared bytes, so a response can be
//!    handed to the caller and stored in a cache without re-reading it
//! 3. **Pluggable network**: routing code talks to a [`Fetcher`], backed by
//!    reqwest in production and by an in-memory table in tests

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod http_fetcher;
pub mod memory;

pub use http_fetcher::{FetcherConfig, HttpFetcher};
pub use memory::MemoryFetcher;

/// Errors that mean no response was received.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Request mode, as seen by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Sub-resource load that may produce an opaque response.
    #[default]
    NoCors,
    /// CORS request.
    Cors,
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub headers: HeaderMap,
}

impl Request {
    /// Create a sub-resource GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            mode: RequestMode::NoCors,
            headers: HeaderMap::new(),
        }
    }

    /// Create a navigation request. Browsers always send an HTML accept
    /// header for these.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"))
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this is a top-level document load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the declared `Accept` header asks for HTML.
    ///
    /// A missing header does not accept HTML.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("text/html"))
    }

    /// Key under which a response to this request is cached: the URL
    /// without its fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Cache key for a URL.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Response type, following the fetch standard's filtered responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response shared via CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Synthesized error response.
    Error,
}

/// HTTP response snapshot.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL (after redirects).
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    /// Whether a redirect was followed to produce this response.
    pub redirected: bool,
    body: Bytes,
}

impl Response {
    /// Create a basic, non-redirected response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: body.into(),
        }
    }

    /// Create a basic 200 response.
    pub fn ok_with(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(url, StatusCode::OK, body)
    }

    /// Create an opaque response: status 0 is not representable, so the
    /// status is kept but the body is dropped.
    pub fn opaque(url: Url, status: StatusCode) -> Self {
        Self {
            response_type: ResponseType::Opaque,
            ..Self::new(url, status, Bytes::new())
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark the response as produced by a redirect.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if response is success (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether this response may be stored and replayed later: a basic,
    /// non-redirected 200.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
            && self.response_type == ResponseType::Basic
            && !self.redirected
    }

    /// Status text for the status code.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Parsed content type.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Body bytes. Cloning is a reference count bump.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Result of a single network attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A 2xx response.
    Success(Response),
    /// A response with any other status. Still a response, not a failure of
    /// the network.
    HttpError(Response),
    /// No response was received.
    NetworkError(NetError),
}

impl FetchOutcome {
    /// Classify a received response by status.
    pub fn from_response(response: Response) -> Self {
        if response.ok() {
            Self::Success(response)
        } else {
            Self::HttpError(response)
        }
    }

    /// Whether a 2xx response was received.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the network failed.
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::NetworkError(_))
    }

    /// Collapse into a result where any received response is `Ok`.
    pub fn into_result(self) -> Result<Response, NetError> {
        match self {
            Self::Success(response) | Self::HttpError(response) => Ok(response),
            Self::NetworkError(err) => Err(err),
        }
    }
}

impl From<Result<Response, NetError>> for FetchOutcome {
    fn from(result: Result<Response, NetError>) -> Self {
        match result {
            Ok(response) => Self::from_response(response),
            Err(err) => Self::NetworkError(err),
        }
    }
}

/// Network access. One call is one attempt; implementations never retry.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request from the network.
    async fn fetch(&self, request: &Request) -> FetchOutcome;
}
