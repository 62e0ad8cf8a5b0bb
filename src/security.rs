//! Shared-secret access gate: extraction from path/query/header/bearer,
//! constant-time validation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::SecurityError;
use crate::headers::HeaderMap;

pub struct SecurityGate {
    enabled: bool,
    secure_key: String,
}

impl SecurityGate {
    pub fn new(enabled: bool, configured_key: Option<String>) -> Result<Self, SecurityError> {
        let secure_key = match configured_key {
            Some(k) => k,
            None => generate_secure_key(),
        };
        Ok(Self { enabled, secure_key })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Extracts a candidate secret and the path with that secret stripped
    /// out (if it was found in the path). First match wins: path prefix,
    /// then `?key=`, then `X-API-Buddy-Key`, then `Authorization: Bearer`.
    pub fn extract<'a>(
        &self,
        path: &'a str,
        headers: &HeaderMap,
        query: &[(String, String)],
    ) -> (Option<String>, String) {
        if let Some((secret, rest)) = extract_from_path(path) {
            return (Some(secret), rest);
        }
        if let Some(secret) = query.iter().find(|(k, _)| k == "key").map(|(_, v)| v.clone()) {
            return (Some(secret), path.to_string());
        }
        if let Some(secret) = headers.get("X-API-Buddy-Key") {
            return (Some(secret.to_string()), path.to_string());
        }
        if let Some(auth) = headers.get("Authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| {
                auth.get(..7).filter(|p| p.eq_ignore_ascii_case("bearer ")).map(|_| &auth[7..])
            }) {
                return (Some(token.trim().to_string()), path.to_string());
            }
        }
        (None, path.to_string())
    }

    /// Constant-time validation. Always true when security is disabled.
    pub fn validate(&self, provided: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(provided) = provided else { return false };
        if provided.is_empty() || self.secure_key.is_empty() {
            return false;
        }
        provided.as_bytes().ct_eq(self.secure_key.as_bytes()).into()
    }
}

fn extract_from_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };
    if (32..=44).contains(&first.len()) && first.bytes().all(is_url_safe_base64_byte) {
        let sanitized = format!("/{rest}");
        Some((first.to_string(), sanitized))
    } else {
        None
    }
}

fn is_url_safe_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// 32 cryptographically random bytes, URL-safe base64, padding stripped.
pub fn generate_secure_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
