//! Configuration tree: defaults, deep-merge, and validation.
//!
//! Deliberately mirrors the reference implementation's merge-then-validate
//! order: a user document is merged over [`Config::default`] *before*
//! validation runs, so a document missing a required field still validates
//! because the default supplied it. See `DESIGN.md` for why this is kept.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080, request_timeout: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_secure_key: bool,
    pub secure_key: Option<String>,
    pub log_security_events: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { require_secure_key: false, secure_key: None, log_security_events: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub database_path: String,
    pub default_ttl_seconds: u64,
    pub max_cache_response_size: u64,
    pub max_cache_entries: u64,
    pub compression_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            default_ttl_seconds: 86_400,
            max_cache_response_size: 10 * 1024 * 1024,
            max_cache_entries: 10_000,
            compression_threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub default_requests_per_hour: u64,
    pub progressive_max_delay: u64,
    pub domain_limits: HashMap<String, u64>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            default_requests_per_hour: 1000,
            progressive_max_delay: 300,
            domain_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DomainMapping {
    pub upstream: String,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub rate_limit_per_minute: u32,
    pub log_access: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { enabled: true, rate_limit_per_minute: 10, log_access: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub enable_console: bool,
    pub enable_file: bool,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_console: true,
            enable_file: false,
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
    pub throttling: ThrottlingConfig,
    pub domain_mappings: HashMap<String, DomainMapping>,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Deep-merges `user` over the built-in defaults, then deserializes
    /// and validates the result. This is the single entry point callers
    /// (the CLI, `/admin/validate-config`) should use.
    pub fn load_merged(user: Value) -> Result<Self, ConfigError> {
        let default_value =
            serde_json::to_value(Config::default()).expect("Config::default always serializes");
        let merged = deep_merge(default_value, user);
        let config: Config = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Invalid(format!("schema mismatch: {e}")))?;
        config.validate().map_err(|errs| ConfigError::Invalid(errs.join("; ")))?;
        Ok(config)
    }

    /// Structural checks beyond what `serde`'s typed deserialization
    /// already enforces (empty strings, zero values that make no sense).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.cache.database_path.trim().is_empty() {
            errors.push("cache.database_path must not be empty".to_string());
        }
        if self.throttling.default_requests_per_hour == 0 {
            errors.push("throttling.default_requests_per_hour must be positive".to_string());
        }
        for (name, mapping) in &self.domain_mappings {
            if mapping.upstream.trim().is_empty() {
                errors.push(format!("domain_mappings.{name}.upstream must not be empty"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns a sanitized JSON rendering with secret-looking fields
    /// redacted, plus the dotted paths that were redacted. Used by
    /// `GET /admin/config`.
    pub fn sanitized(&self) -> (Value, Vec<String>) {
        let raw = serde_json::to_value(self).expect("Config always serializes");
        let mut redacted_paths = Vec::new();
        let sanitized = redact(raw, String::new(), &mut redacted_paths);
        (sanitized, redacted_paths)
    }
}

fn deep_merge(base: Value, override_: Value) -> Value {
    match (base, override_) {
        (Value::Object(mut base_map), Value::Object(override_map)) => {
            for (k, v) in override_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, override_) => override_,
    }
}

const SENSITIVE_SUBSTRINGS: &[&str] = &["key", "secret", "password", "token"];

fn redact(value: Value, path: String, redacted_paths: &mut Vec<String>) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let field_path =
                    if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                let lower = k.to_ascii_lowercase();
                if SENSITIVE_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
                    && !v.is_object()
                {
                    redacted_paths.push(field_path);
                    out.insert(k, Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(k, redact(v, field_path, redacted_paths));
                }
            }
            Value::Object(out)
        }
        other => other,
    }
}
