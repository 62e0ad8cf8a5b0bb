//! `/admin/*` routing: a small dispatch table plus a per-client-IP rate
//! limiter, distinct from the per-domain `ThrottleManager`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use api_buddy_core::config::Config;
use api_buddy_core::monitoring::MonitoringFacade;
use serde_json::{json, Value};

/// Sliding 1-minute window per client IP, grounded on the reference
/// implementation's `AdminRateLimiter`.
pub struct AdminRateLimiter {
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl AdminRateLimiter {
    pub fn new() -> Self {
        Self { requests: Mutex::new(HashMap::new()) }
    }

    pub fn is_allowed(&self, client_ip: &str, limit_per_minute: u32) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.lock().expect("admin rate limiter mutex poisoned");
        let bucket = requests.entry(client_ip.to_string()).or_default();
        bucket.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if bucket.len() as u32 >= limit_per_minute {
            return false;
        }
        bucket.push(now);
        true
    }
}

impl Default for AdminRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AdminContext<'a> {
    pub config: &'a Config,
    pub monitoring: &'a MonitoringFacade,
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
}

pub struct AdminResponse {
    pub status: u16,
    pub body: Value,
}

fn ok(body: Value) -> AdminResponse {
    AdminResponse { status: 200, body }
}

fn error(status: u16, message: impl Into<String>, code: &str) -> AdminResponse {
    AdminResponse {
        status,
        body: json!({
            "timestamp": timestamp(),
            "success": false,
            "error": message.into(),
            "error_code": code,
        }),
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Routes one already-rate-limit-checked admin request. Returns `None` only
/// when `ctx.path` itself isn't a recognized admin route, so the caller can
/// fall back to a 404; a recognized path hit with the wrong method is
/// reported here as a 405, not folded into that 404.
pub fn route(ctx: &AdminContext) -> Option<AdminResponse> {
    match ctx.path {
        "/admin/health" => Some(guard(ctx, "GET", health)),
        "/admin/config" => Some(guard(ctx, "GET", config_handler)),
        "/admin/status" => Some(guard(ctx, "GET", status)),
        "/admin/cache" => Some(guard(ctx, "GET", cache_stats)),
        "/admin/domains" => Some(guard(ctx, "GET", domains)),
        "/admin/validate-config" => Some(guard(ctx, "POST", validate_config)),
        p if p.starts_with("/admin/cache/") => Some(guard(ctx, "GET", cache_domain)),
        _ => None,
    }
}

/// Runs `handler` if `ctx.method == expected_method`, else reports 405.
fn guard(ctx: &AdminContext, expected_method: &str, handler: impl FnOnce(&AdminContext) -> AdminResponse) -> AdminResponse {
    if ctx.method != expected_method {
        return error(
            405,
            format!("method {} not allowed on {}; expected {expected_method}", ctx.method, ctx.path),
            "METHOD_NOT_ALLOWED",
        );
    }
    handler(ctx)
}

fn health(_ctx: &AdminContext) -> AdminResponse {
    ok(json!({ "timestamp": timestamp(), "status": "healthy" }))
}

fn config_handler(ctx: &AdminContext) -> AdminResponse {
    let (sanitized, redacted) = ctx.config.sanitized();
    ok(json!({ "config": sanitized, "redacted_paths": redacted }))
}

fn status(ctx: &AdminContext) -> AdminResponse {
    let status = ctx.monitoring.component_status();
    ok(json!({
        "components": status,
        "proxy": ctx.monitoring.proxy_health(),
        "throttling": serde_json::to_value(ctx.monitoring.throttling_report()).unwrap_or(Value::Null),
    }))
}

fn cache_stats(ctx: &AdminContext) -> AdminResponse {
    let stats = ctx.monitoring.cache_stats();
    ok(serde_json::to_value(stats).unwrap_or(Value::Null))
}

fn cache_domain(ctx: &AdminContext) -> AdminResponse {
    let domain = &ctx.path["/admin/cache/".len()..];
    if !ctx.config.domain_mappings.contains_key(domain) {
        return error(404, format!("unknown domain: {domain}"), "NOT_FOUND");
    }
    let report = ctx.monitoring.domain_report().into_iter().find(|d| d.name == domain);
    ok(serde_json::to_value(report).unwrap_or(Value::Null))
}

fn domains(ctx: &AdminContext) -> AdminResponse {
    ok(serde_json::to_value(ctx.monitoring.domain_report()).unwrap_or(Value::Null))
}

fn validate_config(ctx: &AdminContext) -> AdminResponse {
    if ctx.body.is_empty() {
        return error(400, "request body must not be empty", "INVALID_BODY");
    }
    let parsed: Result<Value, _> = serde_json::from_slice(ctx.body);
    let Ok(envelope) = parsed else {
        return error(400, "request body is not valid JSON", "INVALID_JSON");
    };
    let Some(candidate) = envelope.get("configuration").cloned() else {
        return error(400, "missing 'configuration' field", "INVALID_BODY");
    };

    match Config::load_merged(candidate) {
        Ok(merged) => ok(json!({
            "valid": true,
            "errors": Value::Array(vec![]),
            "warnings": Value::Array(vec![]),
            "merged_config": merged.sanitized().0,
        })),
        Err(e) => ok(json!({
            "valid": false,
            "errors": vec![e.to_string()],
            "warnings": Value::Array(vec![]),
            "merged_config": Value::Null,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_the_limit_then_rejects() {
        let limiter = AdminRateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.is_allowed("1.2.3.4", 3));
        }
        assert!(!limiter.is_allowed("1.2.3.4", 3));
    }

    #[test]
    fn rate_limiter_tracks_clients_independently() {
        let limiter = AdminRateLimiter::new();
        assert!(limiter.is_allowed("a", 1));
        assert!(!limiter.is_allowed("a", 1));
        assert!(limiter.is_allowed("b", 1));
    }

    #[test]
    fn unrecognized_route_returns_none() {
        let config = Config::default();
        let store = std::sync::Arc::new(api_buddy_core::Store::open(":memory:").unwrap());
        let cache: std::sync::Arc<dyn api_buddy_core::monitoring::CacheStatsSource> =
            std::sync::Arc::new(api_buddy_core::CacheEngine::new(
                store.clone(),
                &config.cache,
                api_buddy_core::ConfiguredTtlResolver {
                    default_ttl_seconds: config.cache.default_ttl_seconds,
                    overrides: Default::default(),
                },
            ));
        let throttle = std::sync::Arc::new(api_buddy_core::ThrottleManager::new(
            config.throttling.default_requests_per_hour,
            config.throttling.progressive_max_delay,
            config.throttling.domain_limits.clone(),
        ));
        let monitoring = MonitoringFacade::new(cache, throttle, store, &config);
        let ctx = AdminContext {
            config: &config,
            monitoring: &monitoring,
            method: "GET",
            path: "/admin/nope",
            body: b"",
        };
        assert!(route(&ctx).is_none());
    }
}
