//! Read-only aggregation facade over the core's counters.
//!
//! Takes only read-only interfaces into its dependencies (never a
//! back-pointer into the pipeline or server) to avoid the reference
//! implementation's proxy/cache/monitor cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::cache::{CacheEngine, CacheStats, TtlResolver};
use crate::config::Config;
use crate::store::{SqlValue, Store};
use crate::throttle::ThrottleManager;

/// Narrow, object-safe view onto a cache engine's counters so
/// `MonitoringFacade` doesn't need to be generic over the TTL resolver.
pub trait CacheStatsSource: Send + Sync {
    fn cache_stats(&self) -> CacheStats;
}

impl<R: TtlResolver> CacheStatsSource for CacheEngine<R> {
    fn cache_stats(&self) -> CacheStats {
        self.stats()
    }
}

#[derive(Debug, Serialize)]
pub struct DomainReport {
    pub name: String,
    pub upstream: String,
    pub ttl_seconds: u64,
    pub status: &'static str,
    pub total_requests: u64,
    pub error_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ResponseTimeReport {
    pub average_ms: f64,
    pub recent_samples: Vec<i64>,
    pub total_samples: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorRateReport {
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub by_status_code: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct RequestVolumeReport {
    pub total_requests_last_24h: u64,
    pub cache_hits_last_24h: u64,
    pub cache_hit_rate: f64,
    pub hourly_breakdown: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamMetricsReport {
    pub response_times: ResponseTimeReport,
    pub error_rates: ErrorRateReport,
    pub request_volumes: RequestVolumeReport,
}

#[derive(Debug, Serialize)]
pub struct ThrottlingReport {
    pub requests_per_domain: HashMap<String, u64>,
    pub default_requests_per_hour: u64,
    pub progressive_max_delay: u64,
    pub domain_limits: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct MonitoringFacade {
    cache: Arc<dyn CacheStatsSource>,
    throttle: Arc<ThrottleManager>,
    store: Arc<Store>,
    domains: HashMap<String, (String, u64)>,
    default_requests_per_hour: u64,
    progressive_max_delay: u64,
    domain_limits: HashMap<String, u64>,
    started_at: Instant,
}

impl MonitoringFacade {
    pub fn new(
        cache: Arc<dyn CacheStatsSource>,
        throttle: Arc<ThrottleManager>,
        store: Arc<Store>,
        config: &Config,
    ) -> Self {
        let domains = config
            .domain_mappings
            .iter()
            .map(|(name, mapping)| {
                let ttl = mapping.ttl_seconds.unwrap_or(config.cache.default_ttl_seconds);
                (name.clone(), (mapping.upstream.clone(), ttl))
            })
            .collect();
        Self {
            cache,
            throttle,
            store,
            domains,
            default_requests_per_hour: config.throttling.default_requests_per_hour,
            progressive_max_delay: config.throttling.progressive_max_delay,
            domain_limits: config.throttling.domain_limits.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.cache_stats()
    }

    pub fn domain_report(&self) -> Vec<DomainReport> {
        self.domains
            .iter()
            .map(|(name, (upstream, ttl))| {
                let (total, errors) = self.domain_request_error_counts(name);
                DomainReport {
                    name: name.clone(),
                    upstream: upstream.clone(),
                    ttl_seconds: *ttl,
                    status: "healthy",
                    total_requests: total,
                    error_count: errors,
                }
            })
            .collect()
    }

    fn domain_request_error_counts(&self, domain: &str) -> (u64, u64) {
        let total = self
            .store
            .query("SELECT COUNT(*) AS c FROM metrics WHERE domain = ?1", &[SqlValue::Text(domain.to_string())])
            .ok()
            .and_then(|rows| first_integer(&rows))
            .unwrap_or(0) as u64;
        let errors = self
            .store
            .query(
                "SELECT COUNT(*) AS c FROM metrics WHERE domain = ?1 AND status_code >= 400",
                &[SqlValue::Text(domain.to_string())],
            )
            .ok()
            .and_then(|rows| first_integer(&rows))
            .unwrap_or(0) as u64;
        (total, errors)
    }

    pub fn upstream_metrics(&self, domain: Option<&str>, hours: u64) -> UpstreamMetricsReport {
        let since = now_unix().saturating_sub(hours * 3600);
        let (where_clause, params): (String, Vec<SqlValue>) = match domain {
            Some(d) => (
                "WHERE domain = ?1 AND timestamp >= ?2".to_string(),
                vec![SqlValue::Text(d.to_string()), SqlValue::Integer(since as i64)],
            ),
            None => ("WHERE timestamp >= ?1".to_string(), vec![SqlValue::Integer(since as i64)]),
        };

        let response_times = self.response_time_report(&where_clause, &params);
        let error_rates = self.error_rate_report(&where_clause, &params);
        let request_volumes = self.request_volume_report(&where_clause, &params);

        UpstreamMetricsReport { response_times, error_rates, request_volumes }
    }

    fn response_time_report(&self, where_clause: &str, params: &[SqlValue]) -> ResponseTimeReport {
        let sql = format!(
            "SELECT response_time_ms FROM metrics {where_clause} AND cache_hit = 0 ORDER BY timestamp DESC"
        );
        let rows = self.store.query(&sql, params).unwrap_or_default();
        let samples: Vec<i64> = rows
            .iter()
            .filter_map(|row| row.iter().find(|(name, _)| name == "response_time_ms"))
            .filter_map(|(_, v)| match v {
                SqlValue::Integer(n) => Some(*n),
                _ => None,
            })
            .collect();
        let total_samples = samples.len() as u64;
        let average_ms = if total_samples == 0 {
            0.0
        } else {
            samples.iter().sum::<i64>() as f64 / total_samples as f64
        };
        ResponseTimeReport { average_ms, recent_samples: samples.into_iter().take(20).collect(), total_samples }
    }

    fn error_rate_report(&self, where_clause: &str, params: &[SqlValue]) -> ErrorRateReport {
        let sql = format!("SELECT status_code FROM metrics {where_clause}");
        let rows = self.store.query(&sql, params).unwrap_or_default();
        let mut by_status_code = HashMap::new();
        let mut error_count = 0u64;
        for row in &rows {
            if let Some((_, SqlValue::Integer(status))) =
                row.iter().find(|(name, _)| name == "status_code")
            {
                *by_status_code.entry(status.to_string()).or_insert(0u64) += 1;
                if *status >= 400 {
                    error_count += 1;
                }
            }
        }
        let total_requests = rows.len() as u64;
        let error_rate = if total_requests == 0 { 0.0 } else { error_count as f64 / total_requests as f64 };
        ErrorRateReport {
            total_requests,
            error_count,
            error_rate,
            success_rate: 1.0 - error_rate,
            by_status_code,
        }
    }

    fn request_volume_report(&self, where_clause: &str, params: &[SqlValue]) -> RequestVolumeReport {
        let sql = format!("SELECT cache_hit, timestamp FROM metrics {where_clause}");
        let rows = self.store.query(&sql, params).unwrap_or_default();
        let mut hourly = HashMap::new();
        let mut hits = 0u64;
        for row in &rows {
            let cache_hit = row
                .iter()
                .find(|(name, _)| name == "cache_hit")
                .map(|(_, v)| matches!(v, SqlValue::Integer(1)))
                .unwrap_or(false);
            if cache_hit {
                hits += 1;
            }
            if let Some((_, SqlValue::Integer(ts))) = row.iter().find(|(name, _)| name == "timestamp") {
                let hour_bucket = ts - (ts % 3600);
                *hourly.entry(hour_bucket.to_string()).or_insert(0u64) += 1;
            }
        }
        let total = rows.len() as u64;
        RequestVolumeReport {
            total_requests_last_24h: total,
            cache_hits_last_24h: hits,
            cache_hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            hourly_breakdown: hourly,
        }
    }

    pub fn database_report(&self, database_path: &str) -> serde_json::Value {
        let healthy = self.store.query("SELECT 1", &[]).is_ok();
        if database_path == ":memory:" {
            serde_json::json!({ "backend": "sqlite-memory", "location": "in_memory", "healthy": healthy })
        } else {
            let size_bytes = std::fs::metadata(database_path).ok().map(|m| m.len());
            serde_json::json!({
                "backend": "sqlite",
                "path": database_path,
                "size_bytes": size_bytes,
                "healthy": healthy,
            })
        }
    }

    pub fn proxy_health(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "active_threads": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        })
    }

    pub fn throttling_report(&self) -> ThrottlingReport {
        ThrottlingReport {
            requests_per_domain: self.throttle.domain_request_counts(),
            default_requests_per_hour: self.default_requests_per_hour,
            progressive_max_delay: self.progressive_max_delay,
            domain_limits: self.domain_limits.clone(),
        }
    }

    pub fn component_status(&self) -> HashMap<&'static str, ComponentStatus> {
        let mut statuses = HashMap::new();
        statuses.insert("cache_engine", ComponentStatus { status: "healthy", error: None });
        let store_status = if self.store.query("SELECT 1", &[]).is_ok() {
            ComponentStatus { status: "healthy", error: None }
        } else {
            ComponentStatus { status: "error", error: Some("store query failed".to_string()) }
        };
        statuses.insert("database_manager", store_status);
        statuses.insert("throttle_manager", ComponentStatus { status: "healthy", error: None });
        statuses.insert("security_manager", ComponentStatus { status: "healthy", error: None });
        statuses
    }
}

fn first_integer(rows: &[crate::store::Row]) -> Option<i64> {
    rows.first()
        .and_then(|row| row.first())
        .and_then(|(_, v)| match v {
            SqlValue::Integer(n) => Some(*n),
            _ => None,
        })
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConfiguredTtlResolver;
    use crate::config::Config;

    #[test]
    fn database_report_marks_memory_backend_healthy() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let cache: Arc<dyn CacheStatsSource> = Arc::new(CacheEngine::new(
            store.clone(),
            &Config::default().cache,
            ConfiguredTtlResolver { default_ttl_seconds: 86_400, overrides: Default::default() },
        ));
        let throttle = Arc::new(ThrottleManager::new(1000, 300, Default::default()));
        let facade = MonitoringFacade::new(cache, throttle, store, &Config::default());
        let report = facade.database_report(":memory:");
        assert_eq!(report["backend"], "sqlite-memory");
        assert_eq!(report["healthy"], true);
    }
}
