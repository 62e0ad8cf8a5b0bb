//! End-to-end scenarios driving a fully wired [`Pipeline`] directly against
//! a mocked upstream, bypassing the real socket layer.

use std::collections::HashMap;
use std::sync::Arc;

use api_buddy_core::config::{Config, DomainMapping};
use api_buddy_core::headers::HeaderMap;
use api_buddy_core::{CacheEngine, ConfiguredTtlResolver, MonitoringFacade, SecurityGate, Store, ThrottleManager};
use api_buddy_server::admin::AdminRateLimiter;
use api_buddy_server::pipeline::{Pipeline, Request};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Each test gets its own on-disk database so that parallel test runs don't
/// collide over sqlite's shared-cache in-memory mode.
fn build_pipeline(mut config: Config, db_path: &str) -> Pipeline {
    config.cache.database_path = db_path.to_string();
    config.admin.rate_limit_per_minute = 10_000;
    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.cache.database_path).unwrap());

    let ttl_overrides: HashMap<String, u64> = config
        .domain_mappings
        .iter()
        .filter_map(|(name, mapping)| mapping.ttl_seconds.map(|ttl| (name.clone(), ttl)))
        .collect();
    let cache = Arc::new(CacheEngine::new(
        store.clone(),
        &config.cache,
        ConfiguredTtlResolver { default_ttl_seconds: config.cache.default_ttl_seconds, overrides: ttl_overrides },
    ));

    let throttle = Arc::new(ThrottleManager::new(
        config.throttling.default_requests_per_hour,
        config.throttling.progressive_max_delay,
        config.throttling.domain_limits.clone(),
    ));

    let security =
        Arc::new(SecurityGate::new(config.security.require_secure_key, config.security.secure_key.clone()).unwrap());

    let monitoring_cache: Arc<dyn api_buddy_core::monitoring::CacheStatsSource> = cache.clone();
    let monitoring = Arc::new(MonitoringFacade::new(monitoring_cache, throttle.clone(), store.clone(), &config));

    Pipeline {
        config,
        cache,
        throttle,
        security,
        store,
        monitoring,
        admin_limiter: Arc::new(AdminRateLimiter::new()),
    }
}

fn get(path: &str) -> Request {
    Request { method: "GET".to_string(), path: path.to_string(), headers: HeaderMap::new(), body: Vec::new() }
}

fn post_json(path: &str, body: &str) -> Request {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "application/json");
    Request { method: "POST".to_string(), path: path.to_string(), headers, body: body.as_bytes().to_vec() }
}

fn domain_config(name: &str, upstream: &str) -> Config {
    let mut config = Config::default();
    config
        .domain_mappings
        .insert(name.to_string(), DomainMapping { upstream: upstream.to_string(), ttl_seconds: None });
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_miss_then_hit() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":1}"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let pipeline = build_pipeline(domain_config("jp", &mock_server.uri()), db.path().to_str().unwrap());

    let first = pipeline.handle(get("/jp/todos/1"));
    assert_eq!(first.status, 200);
    assert_eq!(pipeline.cache.stats().misses, 1);
    assert_eq!(pipeline.cache.stats().sets, 1);

    let second = pipeline.handle(get("/jp/todos/1"));
    assert_eq!(second.status, 200);
    assert_eq!(second.body, first.body);
    assert_eq!(pipeline.cache.stats().hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_hit_bypasses_throttle() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut config = domain_config("x", &mock_server.uri());
    config.throttling.domain_limits.insert("x".to_string(), 1);
    let pipeline = build_pipeline(config, db.path().to_str().unwrap());

    let first = pipeline.handle(get("/x/a"));
    assert_eq!(first.status, 200);

    let cached = pipeline.handle(get("/x/a"));
    assert_eq!(cached.status, 200);

    let throttled = pipeline.handle(get("/x/b"));
    assert_eq!(throttled.status, 429);
    assert_eq!(throttled.headers.get("Retry-After"), Some("2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secret_via_path_query_and_header() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock_server)
        .await;

    let mut config = domain_config("m", &mock_server.uri());
    let secret = "abcdefghijklmnopqrstuvwxyzABCDEF".to_string();
    config.security.require_secure_key = true;
    config.security.secure_key = Some(secret.clone());
    let pipeline = build_pipeline(config, db.path().to_str().unwrap());

    let via_path = pipeline.handle(get(&format!("/{secret}/m/p")));
    assert_eq!(via_path.status, 200);

    let via_query = pipeline.handle(get(&format!("/m/p?key={secret}")));
    assert_eq!(via_query.status, 200);

    let mut headers = HeaderMap::new();
    headers.insert("X-API-Buddy-Key", secret.clone());
    let via_header =
        pipeline.handle(Request { method: "GET".to_string(), path: "/m/p".to_string(), headers, body: Vec::new() });
    assert_eq!(via_header.status, 200);

    let unauthorized = pipeline.handle(get("/m/p"));
    assert_eq!(unauthorized.status, 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_body_canonicalization_shares_a_cache_entry() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stored"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let pipeline = build_pipeline(domain_config("m", &mock_server.uri()), db.path().to_str().unwrap());

    let a = pipeline.handle(post_json("/m/x", r#"{"a":1,"b":2}"#));
    assert_eq!(a.status, 200);
    let b = pipeline.handle(post_json("/m/x", r#"{"b":2,"a":1}"#));
    assert_eq!(b.status, 200);

    assert_eq!(pipeline.cache.stats().sets, 1);
    assert_eq!(pipeline.cache.stats().hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmapped_absolute_uri_target_is_rejected_not_forwarded() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let pipeline = build_pipeline(domain_config("m", "http://127.0.0.1:1"), db.path().to_str().unwrap());

    let resp = pipeline.handle(get("http://evil.example.com/x"));
    assert_eq!(resp.status, 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expiry_refetches_and_counts_as_expired() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut config = domain_config("m", &mock_server.uri());
    config.domain_mappings.get_mut("m").unwrap().ttl_seconds = Some(1);
    let pipeline = build_pipeline(config, db.path().to_str().unwrap());

    let first = pipeline.handle(get("/m/x"));
    assert_eq!(first.status, 200);
    assert_eq!(pipeline.cache.stats().sets, 1);

    std::thread::sleep(std::time::Duration::from_secs(2));

    let second = pipeline.handle(get("/m/x"));
    assert_eq!(second.status, 200);
    assert_eq!(pipeline.cache.stats().expired, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progressive_back_off_doubles_up_to_the_cap() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut config = domain_config("m", &mock_server.uri());
    config.throttling.domain_limits.insert("m".to_string(), 1);
    config.throttling.progressive_max_delay = 8;
    let pipeline = build_pipeline(config, db.path().to_str().unwrap());

    let mut delays = Vec::new();
    for i in 0..6 {
        let resp = pipeline.handle(get(&format!("/m/different-path-{i}")));
        if resp.status == 429 {
            delays.push(resp.headers.get("Retry-After").unwrap().parse::<u64>().unwrap());
        }
    }
    assert_eq!(delays, vec![2, 4, 8, 8, 8]);
}
