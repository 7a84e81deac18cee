//! End-to-end scenarios for the offline worker, driven through the host.

use std::sync::Arc;

use http::header::{ACCEPT, LINK};
use http::{HeaderValue, Method, StatusCode};
use storybook_common::{init_logging, LogConfig, OfflineConfig};
use storybook_net::{MemoryFetcher, Request, Response};
use storybook_sw::{
    dispatch, persist, HostEvent, ResponseSource, RouteDecision, ServiceWorkerError,
    ServiceWorkerHost, ServiceWorkerState, WorkerEvent,
};
use tokio::sync::mpsc;
use url::Url;

const OFFLINE_PAGE: &str = "<!DOCTYPE html><html><body><h1>You're offline</h1></body></html>";

/// The site as served by the origin: every precached asset plus a few extras.
fn site(config: &OfflineConfig) -> MemoryFetcher {
    let offline = config.offline_url().unwrap();
    config
        .precache_urls()
        .unwrap()
        .into_iter()
        .filter(|url| *url != offline)
        .fold(MemoryFetcher::new(), |f, url| {
            let body = format!("content of {}", url.path());
            f.with_page(&url, body)
        })
        .with_page(&offline, OFFLINE_PAGE)
        .with_page(&config.resolve("./images/hero.png").unwrap(), vec![0x89, b'P', b'N', b'G'])
        .with_page(&Url::parse("https://cdn.example.com/lib.js").unwrap(), "cdn")
}

async fn installed(config: &OfflineConfig) -> (ServiceWorkerHost, Arc<MemoryFetcher>) {
    init_logging(&LogConfig::for_tests());
    let fetcher = Arc::new(site(config));
    let (host, _events) = ServiceWorkerHost::new(fetcher.clone());
    host.register(config.clone()).await.unwrap();
    (host, fetcher)
}

async fn cache_keys(host: &ServiceWorkerHost, name: &str) -> Vec<String> {
    host.caches()
        .read()
        .await
        .get(name)
        .map(|cache| cache.keys().into_iter().map(String::from).collect())
        .unwrap_or_default()
}

fn routed(decision: RouteDecision) -> (Response, ResponseSource) {
    match decision {
        RouteDecision::Respond(routed) => (routed.response, routed.source),
        RouteDecision::PassThrough => panic!("request was not intercepted"),
    }
}

#[tokio::test]
async fn install_precaches_app_shell() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;

    assert_eq!(host.caches().read().await.keys(), vec!["storybook-v1"]);
    let keys = cache_keys(&host, "storybook-v1").await;
    assert_eq!(keys.len(), 12);
    assert!(keys.contains(&"http://localhost:8000/".to_string()));
    assert!(keys.contains(&"http://localhost:8000/index.html".to_string()));
    assert_eq!(fetcher.fetch_count(), 12);
}

#[tokio::test]
async fn reinstalling_same_version_is_idempotent() {
    let config = OfflineConfig::default();
    let (host, _fetcher) = installed(&config).await;
    let before = cache_keys(&host, "storybook-v1").await;

    host.register(config).await.unwrap();

    assert_eq!(host.caches().read().await.keys(), vec!["storybook-v1"]);
    assert_eq!(cache_keys(&host, "storybook-v1").await, before);
}

#[tokio::test]
async fn navigation_online_comes_from_network() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    let about = config.resolve("./about.html").unwrap();
    let before = cache_keys(&host, "storybook-v1").await;

    let (response, source) = routed(host.handle_fetch(&Request::navigate(about.clone())).await.unwrap());

    assert_eq!(source, ResponseSource::Network);
    assert_eq!(response.text().unwrap(), "content of /about.html");
    assert_eq!(fetcher.fetches_for(&about).await, 2);
    assert_eq!(cache_keys(&host, "storybook-v1").await, before);
}

#[tokio::test]
async fn navigation_offline_serves_offline_document() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    fetcher.set_offline(true);

    let request = Request::navigate(config.resolve("./about.html").unwrap());
    let (response, source) = routed(host.handle_fetch(&request).await.unwrap());

    assert_eq!(source, ResponseSource::OfflineFallback);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body().as_ref(), OFFLINE_PAGE.as_bytes());
}

#[tokio::test]
async fn navigation_not_found_is_returned_as_is() {
    let config = OfflineConfig::default();
    let (host, _fetcher) = installed(&config).await;

    let request = Request::navigate(config.resolve("./missing.html").unwrap());
    let response = host.fetch(request).await.unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn precached_asset_needs_no_network() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    let fetches = fetcher.fetch_count();

    let styles = config.resolve("./css/styles.css").unwrap();
    let (response, source) = routed(host.handle_fetch(&Request::get(styles)).await.unwrap());

    assert_eq!(source, ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "content of /css/styles.css");
    assert_eq!(fetcher.fetch_count(), fetches);
}

#[tokio::test]
async fn runtime_asset_is_cached_after_first_fetch() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    let hero = config.resolve("./images/hero.png").unwrap();

    let (_, first) = routed(host.handle_fetch(&Request::get(hero.clone())).await.unwrap());
    assert_eq!(first, ResponseSource::Network);
    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 13);

    fetcher.set_offline(true);
    let (response, second) = routed(host.handle_fetch(&Request::get(hero.clone())).await.unwrap());
    assert_eq!(second, ResponseSource::Cache);
    assert_eq!(response.body().as_ref(), &[0x89, b'P', b'N', b'G']);
    assert_eq!(fetcher.fetches_for(&hero).await, 1);
}

#[tokio::test]
async fn stylesheet_outside_precache_is_cached_on_first_fetch() {
    let site_config = OfflineConfig::default();
    let config = site_config
        .clone()
        .with_precache(["./", "./index.html", "./offline.html"]);
    let fetcher = Arc::new(site(&site_config));
    let (host, _events) = ServiceWorkerHost::new(fetcher.clone());
    host.register(config.clone()).await.unwrap();

    let styles = config.resolve("./css/styles.css").unwrap();
    let response = host.fetch(Request::get(styles.clone())).await.unwrap();
    assert_eq!(response.text().unwrap(), "content of /css/styles.css");

    let (cached, source) = routed(host.handle_fetch(&Request::get(styles.clone())).await.unwrap());
    assert_eq!(source, ResponseSource::Cache);
    assert_eq!(cached.text().unwrap(), "content of /css/styles.css");
    assert_eq!(fetcher.fetches_for(&styles).await, 1);
}

#[tokio::test]
async fn missing_image_is_not_cached_and_not_replaced() {
    let config = OfflineConfig::default();
    let (host, _fetcher) = installed(&config).await;

    let request = Request::get(config.resolve("./images/missing.png").unwrap())
        .header(ACCEPT, HeaderValue::from_static("image/avif,image/webp,*/*"));
    let (response, source) = routed(host.handle_fetch(&request).await.unwrap());

    assert_eq!(source, ResponseSource::Network);
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 12);
}

#[tokio::test]
async fn opaque_response_is_not_cached() {
    let config = OfflineConfig::default();
    let widget = config.resolve("./widget.js").unwrap();
    let fetcher = Arc::new(site(&config).with_response(&widget, Response::opaque(widget.clone(), StatusCode::OK)));
    let (host, _events) = ServiceWorkerHost::new(fetcher.clone());
    host.register(config).await.unwrap();

    host.fetch(Request::get(widget.clone())).await.unwrap();
    host.fetch(Request::get(widget.clone())).await.unwrap();

    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 12);
    assert_eq!(fetcher.fetches_for(&widget).await, 2);
}

#[tokio::test]
async fn offline_sub_resource_accepting_html_gets_offline_document() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    fetcher.set_offline(true);

    let request = Request::get(config.resolve("./partials/header.html").unwrap())
        .header(ACCEPT, HeaderValue::from_static("text/html"));
    let (response, source) = routed(host.handle_fetch(&request).await.unwrap());
    assert_eq!(source, ResponseSource::OfflineFallback);
    assert_eq!(response.text().unwrap(), OFFLINE_PAGE);

    let script = Request::get(config.resolve("./js/extra.js").unwrap());
    let err = host.handle_fetch(&script).await.unwrap_err();
    assert!(err.is_network_error());
}

#[tokio::test]
async fn offline_html_sub_resource_without_offline_document_fails() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    let offline = config.offline_url().unwrap();
    {
        let caches = host.caches();
        let mut caches = caches.write().await;
        assert!(caches.get_mut("storybook-v1").unwrap().delete(&offline));
    }
    fetcher.set_offline(true);

    let request = Request::get(config.resolve("./partials/footer.html").unwrap())
        .header(ACCEPT, HeaderValue::from_static("text/html"));
    let err = host.handle_fetch(&request).await.unwrap_err();

    assert!(matches!(
        err,
        ServiceWorkerError::Network(storybook_net::NetError::Offline)
    ));
    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 11);
}

#[tokio::test]
async fn cached_response_keeps_repeated_headers() {
    let config = OfflineConfig::default();
    let page = config.resolve("./fragments/hero.html").unwrap();
    let response = Response::ok_with(page.clone(), "<section>")
        .header(LINK, HeaderValue::from_static("</css/styles.css>; rel=preload"))
        .header(LINK, HeaderValue::from_static("</js/main.js>; rel=preload"));
    let fetcher = Arc::new(site(&config).with_response(&page, response));
    let (host, _events) = ServiceWorkerHost::new(fetcher.clone());
    host.register(config).await.unwrap();

    let (network, first) = routed(host.handle_fetch(&Request::get(page.clone())).await.unwrap());
    let (cached, second) = routed(host.handle_fetch(&Request::get(page.clone())).await.unwrap());

    assert_eq!(first, ResponseSource::Network);
    assert_eq!(second, ResponseSource::Cache);
    assert_eq!(network.headers.get_all(LINK).iter().count(), 2);
    assert_eq!(
        cached.headers.get_all(LINK).iter().collect::<Vec<_>>(),
        network.headers.get_all(LINK).iter().collect::<Vec<_>>()
    );
    assert_eq!(fetcher.fetches_for(&page).await, 1);
}

#[tokio::test]
async fn foreign_and_non_get_requests_bypass_the_cache() {
    let config = OfflineConfig::default();
    let (host, fetcher) = installed(&config).await;
    let cdn = Url::parse("https://cdn.example.com/lib.js").unwrap();

    assert!(matches!(
        host.handle_fetch(&Request::get(cdn.clone())).await.unwrap(),
        RouteDecision::PassThrough
    ));
    let response = host.fetch(Request::get(cdn.clone())).await.unwrap();
    assert_eq!(response.text().unwrap(), "cdn");
    assert_eq!(fetcher.fetches_for(&cdn).await, 1);

    let contact = config.resolve("./contact.html").unwrap();
    let post = Request::get(contact).method(Method::POST);
    assert!(matches!(
        host.handle_fetch(&post).await.unwrap(),
        RouteDecision::PassThrough
    ));

    assert_eq!(host.caches().read().await.keys(), vec!["storybook-v1"]);
    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 12);
}

#[tokio::test]
async fn new_version_sweeps_old_caches() {
    let v1 = OfflineConfig::default();
    let v2 = v1.clone().with_version("v2");
    let (host, _fetcher) = installed(&v1).await;
    let first = host.active().await.unwrap();

    let second = host.register(v2).await.unwrap();

    assert!(second.is_active());
    assert!(first.is_redundant());
    assert_eq!(host.caches().read().await.keys(), vec!["storybook-v2"]);
    assert_eq!(cache_keys(&host, "storybook-v2").await.len(), 12);
}

#[tokio::test]
async fn failed_update_keeps_current_version_serving() {
    let v1 = OfflineConfig::default();
    let v2 = v1
        .clone()
        .with_version("v2")
        .with_precache(["./", "./offline.html", "./js/feature.js"]);
    let (host, fetcher) = installed(&v1).await;

    let err = host.register(v2).await.unwrap_err();
    match err {
        ServiceWorkerError::InstallFailed { url, reason } => {
            assert_eq!(url, "http://localhost:8000/js/feature.js");
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(host.active().await.unwrap().version(), "v1");
    assert!(cache_keys(&host, "storybook-v2").await.is_empty());
    assert_eq!(cache_keys(&host, "storybook-v1").await.len(), 12);

    fetcher.set_offline(true);
    let request = Request::navigate(v1.resolve("./faq.html").unwrap());
    let (response, _) = routed(host.handle_fetch(&request).await.unwrap());
    assert_eq!(response.text().unwrap(), OFFLINE_PAGE);
}

#[tokio::test]
async fn waiting_version_activates_when_pages_close() {
    let v1 = OfflineConfig::default();
    let v2 = v1.clone().with_version("v2").with_skip_waiting(false);
    let fetcher = Arc::new(site(&v1));
    let (host, mut events) = ServiceWorkerHost::new(fetcher);

    let first = host.register(v1.clone()).await.unwrap();
    let home = host.open_client(v1.resolve("./").unwrap()).await;
    let about = host.open_client(v1.resolve("./about.html").unwrap()).await;

    let second = host.register(v2).await.unwrap();
    assert_eq!(second.state(), ServiceWorkerState::Installed);
    assert_eq!(
        host.caches().read().await.keys(),
        vec!["storybook-v1", "storybook-v2"]
    );

    host.close_client(home).await.unwrap();
    assert_eq!(host.active().await.unwrap().id(), first.id());

    host.close_client(about).await.unwrap();
    assert_eq!(host.active().await.unwrap().id(), second.id());
    assert_eq!(host.caches().read().await.keys(), vec!["storybook-v2"]);

    let mut swept = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HostEvent::CachesSwept { deleted } = event {
            swept.extend(deleted);
        }
    }
    assert_eq!(swept, vec!["storybook-v1"]);
}

#[tokio::test]
async fn events_are_served_concurrently() {
    let config = OfflineConfig::default();
    let fetcher = Arc::new(site(&config));
    let (host, _events) = ServiceWorkerHost::new(fetcher.clone());
    let host = Arc::new(host);

    let (tx, rx) = mpsc::channel(32);
    let server = tokio::spawn(Arc::clone(&host).serve(rx));

    let worker_id = dispatch(&tx, WorkerEvent::install(config.clone())).await.unwrap();
    assert_eq!(host.active().await.unwrap().id(), worker_id);

    let paths = ["./css/styles.css", "./js/main.js", "./js/components.js", "./manifest.json"];
    let requests = paths.iter().map(|path| {
        let request = Request::get(config.resolve(path).unwrap());
        let tx = tx.clone();
        async move { dispatch(&tx, WorkerEvent::fetch(request)).await }
    });
    let fetches = fetcher.fetch_count();
    for response in futures::future::join_all(requests).await {
        assert!(response.unwrap().ok());
    }
    assert_eq!(fetcher.fetch_count(), fetches);

    drop(tx);
    server.await.unwrap();
}

#[tokio::test]
async fn dispatch_after_host_stops_fails() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let result = dispatch(&tx, WorkerEvent::activate()).await;
    assert!(matches!(result, Err(ServiceWorkerError::WorkerStopped)));
}

#[tokio::test]
async fn restart_offline_from_saved_caches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.json");
    let config = OfflineConfig::default();

    {
        let (host, _fetcher) = installed(&config).await;
        let caches = host.caches();
        let storage = caches.read().await;
        persist::save(&storage, &path).await.unwrap();
    }

    let storage = persist::load(&path).await.unwrap();
    let fetcher = Arc::new(site(&config));
    fetcher.set_offline(true);
    let (host, _events) = ServiceWorkerHost::with_caches(fetcher.clone(), storage);

    let worker = host.resume(config.clone()).await.unwrap();
    assert!(worker.is_active());
    assert_eq!(fetcher.fetch_count(), 0);

    let styles = host
        .fetch(Request::get(config.resolve("./css/styles.css").unwrap()))
        .await
        .unwrap();
    assert_eq!(styles.text().unwrap(), "content of /css/styles.css");

    let page = host
        .fetch(Request::navigate(config.resolve("./pricing.html").unwrap()))
        .await
        .unwrap();
    assert_eq!(page.text().unwrap(), OFFLINE_PAGE);
}
