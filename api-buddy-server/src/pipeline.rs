//! The `RECV → SECURITY → ROUTE → {ADMIN | CACHE_LOOKUP | TRANSPARENT} →
//! THROTTLE → FORWARD → STORE → RESPOND` request state machine.
//!
//! One `Pipeline` is shared (via `Arc`) across every connection worker; one
//! call to [`Pipeline::handle`] processes exactly one request and shares no
//! mutable state with any sibling call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use api_buddy_core::cache::derive_key;
use api_buddy_core::config::Config;
use api_buddy_core::headers::HeaderMap;
use api_buddy_core::monitoring::MonitoringFacade;
use api_buddy_core::store::SqlValue;
use api_buddy_core::{CacheEngine, CachedResponse, ConfiguredTtlResolver, SecurityGate, Store, ThrottleManager};
use tracing::{debug, info, warn};

use crate::admin::{self, AdminContext, AdminRateLimiter};

pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    fn plain_text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/plain");
        Self { status, headers, body: body.into().into_bytes() }
    }

    fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/json");
        Self { status, headers, body: serde_json::to_vec(value).unwrap_or_default() }
    }
}

pub struct Pipeline {
    pub config: Arc<Config>,
    pub cache: Arc<CacheEngine<ConfiguredTtlResolver>>,
    pub throttle: Arc<ThrottleManager>,
    pub security: Arc<SecurityGate>,
    pub store: Arc<Store>,
    pub monitoring: Arc<MonitoringFacade>,
    pub admin_limiter: Arc<AdminRateLimiter>,
}

impl Pipeline {
    pub fn handle(&self, request: Request) -> Response {
        let Request { method, path, headers, body } = request;
        debug!(%method, %path, "RECV");

        let (query, path_without_query) = split_query(&path);

        let (secret, sanitized_path) = self.security.extract(&path_without_query, &headers, &query);
        if self.config.security.require_secure_key && !self.security.validate(secret.as_deref()) {
            if self.config.security.log_security_events {
                warn!("Unauthorized request: invalid or missing secure key");
            }
            return Response::plain_text(401, "Unauthorized: Invalid or missing secure key\n");
        }

        if sanitized_path.starts_with("/admin/") {
            return self.handle_admin(&method, &sanitized_path, &headers, &body);
        }

        match self.match_domain(&sanitized_path, &headers) {
            Some(domain) => self.handle_matched(&method, &sanitized_path, &headers, body, &domain),
            None => self.reject_unmapped(&sanitized_path, &headers),
        }
    }

    fn handle_admin(&self, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) -> Response {
        if !self.config.admin.enabled {
            return Response::plain_text(404, "Not Found\n");
        }
        let client_ip = headers.get("X-Forwarded-For").unwrap_or("unknown").to_string();
        if !self.admin_limiter.is_allowed(&client_ip, self.config.admin.rate_limit_per_minute) {
            return Response::json(
                429,
                &serde_json::json!({
                    "success": false,
                    "error": "admin rate limit exceeded",
                    "error_code": "RATE_LIMIT_EXCEEDED",
                }),
            );
        }
        if self.config.admin.log_access {
            info!(%path, %client_ip, "admin access");
        }
        let ctx = AdminContext { config: &self.config, monitoring: &self.monitoring, method, path, body };
        match admin::route(&ctx) {
            Some(resp) => Response::json(resp.status, &resp.body),
            None => Response::json(
                404,
                &serde_json::json!({ "success": false, "error": "unknown admin route", "error_code": "NOT_FOUND" }),
            ),
        }
    }

    /// Resolves the logical domain per §4.5 ROUTE: path-prefix match first,
    /// then absolute-URI host match.
    fn match_domain(&self, path: &str, headers: &HeaderMap) -> Option<String> {
        for name in self.config.domain_mappings.keys() {
            if path == format!("/{name}") || path.starts_with(&format!("/{name}/")) {
                return Some(name.clone());
            }
        }
        if let Some(host) = extract_host(path, headers) {
            if self.config.domain_mappings.contains_key(&host) {
                return Some(host);
            }
        }
        None
    }

    fn handle_matched(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        domain: &str,
    ) -> Response {
        let cacheable = matches!(method, "GET" | "POST");
        let content_type = headers.get("Content-Type");

        let cache_key = if cacheable {
            Some(derive_key(method, path, Some(&body), content_type))
        } else {
            None
        };

        if let Some(key) = &cache_key {
            match self.cache.lookup(key) {
                Ok(Some(hit)) => {
                    info!(%domain, key = %key, "cache hit");
                    self.record_metric(domain, method, 0, hit.body.len(), true, hit.status);
                    return Response { status: hit.status, headers: hit.headers, body: hit.body };
                }
                Ok(None) => info!(%domain, key = %key, "cache miss"),
                Err(e) => warn!(%domain, error = %e, "cache lookup failed"),
            }
        }

        self.throttle.record_request(domain);
        let decision = self.throttle.should_throttle(domain);
        if decision.throttled {
            info!(%domain, delay = decision.delay_seconds, "throttled upstream request");
            self.record_metric(domain, method, 0, 0, false, 429);
            let mut headers = HeaderMap::new();
            headers.insert("Retry-After", decision.delay_seconds.to_string());
            headers.insert("X-RateLimit-Limit", decision.limit.to_string());
            headers.insert("X-RateLimit-Remaining", decision.remaining.to_string());
            headers.insert("X-RateLimit-Reset", decision.reset_seconds.to_string());
            return Response { status: 429, headers, body: b"Too Many Requests\n".to_vec() };
        }

        let upstream_url = match self.resolve_upstream(path, domain) {
            Ok(url) => url,
            Err(resp) => return resp,
        };

        let outcome = forward(method, &upstream_url, headers, &body, self.config.server.request_timeout);
        let (status, response_headers, response_body, response_time_ms) = match outcome {
            Ok(r) => r,
            Err(resp) => return resp,
        };

        self.record_metric(domain, method, response_time_ms, response_body.len(), false, status);

        if cacheable && (200..300).contains(&status) {
            if let Some(key) = &cache_key {
                let cached = CachedResponse {
                    body: response_body.clone(),
                    headers: response_headers.clone(),
                    status,
                    created_at: 0,
                    ttl_seconds: 0,
                    access_count: 0,
                    last_accessed: 0,
                };
                if let Err(e) = self.cache.store(key, cached, Some(domain)) {
                    warn!(%domain, error = %e, "failed to store cache entry");
                }
            }
        }

        Response { status, headers: response_headers, body: response_body }
    }

    /// No domain in `domain_mappings` matched. Per §4.5 FORWARD's routing
    /// classification this is always a 404, never a raw pass-through to
    /// whatever `path` names (an absolute-form request line like
    /// `GET http://evil.com/x` must not result in an outbound call).
    fn reject_unmapped(&self, path: &str, headers: &HeaderMap) -> Response {
        let (_, path_part) = split_query(path);
        let name = extract_host(path, headers).unwrap_or_else(|| {
            path_part.trim_start_matches('/').split('/').next().unwrap_or("").to_string()
        });
        debug!(%path, domain = %name, "rejecting request for an unmapped domain");
        Response::plain_text(404, format!("Domain not mapped: {name}\n"))
    }

    fn resolve_upstream(&self, path: &str, domain: &str) -> Result<String, Response> {
        let mapping = self.config.domain_mappings.get(domain);
        let Some(mapping) = mapping else {
            return Err(Response::plain_text(404, format!("Domain not mapped: {domain}\n")));
        };
        if mapping.upstream.trim().is_empty() {
            return Err(Response::plain_text(502, format!("No upstream configured for domain: {domain}\n")));
        }

        let prefix = format!("/{domain}");
        let (path_part, query_part) = split_query(path);
        let rest = path_part
            .strip_prefix(&prefix)
            .unwrap_or(&path_part)
            .trim_start_matches('/');
        let mut url = format!("{}/{}", mapping.upstream.trim_end_matches('/'), rest);
        if !query_part.is_empty() {
            let qs: Vec<String> = query_part.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        Ok(url)
    }

    fn record_metric(
        &self,
        domain: &str,
        method: &str,
        response_time_ms: u64,
        size_bytes: usize,
        cache_hit: bool,
        status_code: u16,
    ) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs();
        let _ = self.store.update(
            "INSERT INTO metrics (domain, method, cache_hit, response_time_ms, response_size_bytes, status_code, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            &[
                SqlValue::Text(domain.to_string()),
                SqlValue::Text(method.to_string()),
                SqlValue::Integer(cache_hit as i64),
                SqlValue::Integer(response_time_ms as i64),
                SqlValue::Integer(size_bytes as i64),
                SqlValue::Integer(status_code as i64),
                SqlValue::Integer(now as i64),
            ],
        );
    }
}

fn split_query(path: &str) -> (Vec<(String, String)>, String) {
    match path.split_once('?') {
        Some((p, q)) => (url::form_urlencoded::parse(q.as_bytes()).into_owned().collect(), p.to_string()),
        None => (Vec::new(), path.to_string()),
    }
}

fn extract_host(path: &str, headers: &HeaderMap) -> Option<String> {
    if let Ok(parsed) = url::Url::parse(path) {
        return parsed.host_str().map(str::to_string);
    }
    headers.get("Host").map(|h| h.split(':').next().unwrap_or(h).to_string())
}

/// Issues the outbound HTTP call and rewrites the response per §4.5
/// FORWARD. Returns `(status, headers, body, elapsed_ms)` on success, or a
/// fully-formed client-facing error `Response` on failure.
fn forward(
    method: &str,
    url: &str,
    inbound_headers: &HeaderMap,
    body: &[u8],
    timeout_secs: u64,
) -> Result<(u16, HeaderMap, Vec<u8>, u64), Response> {
    let start = Instant::now();
    let agent = ureq::AgentBuilder::new().timeout(Duration::from_secs(timeout_secs)).build();
    let mut request = agent.request(method, url);
    for (name, value) in inbound_headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "connection" || lower == "content-length" {
            continue;
        }
        request = request.set(name, value);
    }
    request = request.set("Accept-Encoding", "gzip, deflate");

    let result = if method == "POST" && !body.is_empty() {
        request.send_bytes(body)
    } else {
        request.call()
    };

    let response = match result {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, resp)) => {
            let reason = resp.status_text().to_string();
            warn!(%url, code, %reason, "upstream returned an HTTP error");
            return Err(Response::plain_text(502, format!("Upstream HTTP error: {code} {reason}\n")));
        }
        Err(ureq::Error::Transport(t)) => {
            warn!(%url, error = %t, "upstream network error");
            return Err(Response::plain_text(502, format!("Upstream network error: {t}\n")));
        }
    };

    let status = response.status();
    let mut response_headers = HeaderMap::new();
    for name in response.headers_names() {
        if let Some(value) = response.header(&name) {
            response_headers.append(name, value.to_string());
        }
    }

    let mut raw_body = Vec::new();
    if std::io::Read::read_to_end(&mut response.into_reader(), &mut raw_body).is_err() {
        return Err(Response::plain_text(502, "Upstream server error: failed to read response body\n"));
    }

    let encoding = response_headers.get("Content-Encoding").map(str::to_ascii_lowercase);
    let (final_body, decompressed) = decompress_if_needed(raw_body, encoding.as_deref());

    if decompressed {
        response_headers.remove("Content-Encoding");
        response_headers.remove("Transfer-Encoding");
        response_headers.insert("Content-Length", final_body.len().to_string());
    } else if response_headers.get("Transfer-Encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false) {
        response_headers.remove("Transfer-Encoding");
        if response_headers.get("Content-Length").is_none() {
            response_headers.insert("Content-Length", final_body.len().to_string());
        }
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    Ok((status, response_headers, final_body, elapsed_ms))
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn decompress_if_needed(body: Vec<u8>, content_encoding: Option<&str>) -> (Vec<u8>, bool) {
    let looks_gzip = body.len() >= 2 && body[0..2] == GZIP_MAGIC;
    let declared_gzip = content_encoding == Some("gzip");
    let declared_deflate = content_encoding == Some("deflate");

    if looks_gzip || declared_gzip {
        let mut decoder = flate2::read::GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        if std::io::Read::read_to_end(&mut decoder, &mut out).is_ok() {
            return (out, true);
        }
    } else if declared_deflate {
        let mut decoder = flate2::read::ZlibDecoder::new(&body[..]);
        let mut out = Vec::new();
        if std::io::Read::read_to_end(&mut decoder, &mut out).is_ok() {
            return (out, true);
        }
    }
    (body, false)
}
