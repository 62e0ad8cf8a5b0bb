//! Deterministic cache key derivation.
//!
//! A key depends only on (method, normalized URL, normalized body) so that
//! logically-identical requests collapse onto one entry regardless of
//! query-parameter order, scheme/host case, trailing slash, or JSON
//! whitespace.

use sha2::{Digest, Sha256};
use url::Url;

/// Derives the 64-character lowercase hex cache key for one request.
pub fn derive_key(method: &str, url: &str, body: Option<&[u8]>, content_type: Option<&str>) -> String {
    let method_upper = method.to_ascii_uppercase();
    let normalized_url = normalize_url(url);

    let mut key_input = format!("{method_upper}:{normalized_url}");
    if method_upper == "POST" {
        if let Some(body) = body {
            if !body.is_empty() {
                key_input.push(':');
                key_input.push_str(&normalize_body(body, content_type));
            }
        }
    }

    let digest = Sha256::digest(key_input.as_bytes());
    hex::encode(digest)
}

/// Lowercases scheme/host, strips a trailing slash (unless path is `/`),
/// and sorts query parameters by (name, value) while preserving
/// duplicate keys.
fn normalize_url(raw: &str) -> String {
    const DUMMY_BASE: &str = "http://cache-key.invalid";
    let has_scheme = raw.contains("://");

    let parsed = if has_scheme {
        Url::parse(raw)
    } else {
        Url::options().base_url(Some(&Url::parse(DUMMY_BASE).unwrap())).parse(raw)
    };

    let mut url = match parsed {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    let mut path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    url.set_path(&path);

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    if has_scheme {
        url.to_string()
    } else {
        match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        }
    }
}

/// Canonicalizes a JSON body (sorted keys, no insignificant whitespace);
/// falls back to the hex SHA-256 of the raw bytes for anything else.
fn normalize_body(body: &[u8], content_type: Option<&str>) -> String {
    let is_json = content_type.map(|ct| ct.contains("json")).unwrap_or(false);
    if is_json {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            // serde_json's default `Map` is key-sorted (the `preserve_order`
            // feature is not enabled), so `to_string` already canonicalizes.
            if let Ok(canonical) = serde_json::to_string(&value) {
                return canonical;
            }
        }
    }
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_yield_identical_keys() {
        let a = derive_key("GET", "/jp/todos/1", None, None);
        let b = derive_key("GET", "/jp/todos/1", None, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn scheme_host_case_and_trailing_slash_are_insignificant() {
        let a = derive_key("GET", "HTTP://Example.com/a/b/", None, None);
        let b = derive_key("GET", "http://example.com/a/b", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn root_path_trailing_slash_is_significant_boundary() {
        let root = derive_key("GET", "http://example.com/", None, None);
        let other = derive_key("GET", "http://example.com", None, None);
        // Path "/" is the documented exception: it is never stripped, and
        // a bare-authority URL normalizes to "/" too, so these match.
        assert_eq!(root, other);
    }

    #[test]
    fn query_parameter_order_is_insignificant() {
        let a = derive_key("GET", "/x?b=2&a=1", None, None);
        let b = derive_key("GET", "/x?a=1&b=2", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_query_keys_are_preserved() {
        let a = derive_key("GET", "/x?a=1&a=2", None, None);
        let b = derive_key("GET", "/x?a=2&a=1", None, None);
        // Both values of `a` survive sorting, but as a sorted pair list the
        // two orderings normalize to the same sequence.
        assert_eq!(a, b);
    }

    #[test]
    fn json_body_whitespace_and_key_order_are_insignificant() {
        let a = derive_key(
            "POST",
            "/m/x",
            Some(br#"{"a":1,"b":2}"#),
            Some("application/json"),
        );
        let b = derive_key(
            "POST",
            "/m/x",
            Some(b"{ \"b\": 2, \"a\": 1 }"),
            Some("application/json"),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn non_json_body_changes_the_key() {
        let a = derive_key("POST", "/m/x", Some(b"hello"), Some("text/plain"));
        let b = derive_key("POST", "/m/x", Some(b"world"), Some("text/plain"));
        assert_ne!(a, b);
    }

    #[test]
    fn get_requests_ignore_body() {
        let a = derive_key("GET", "/m/x", Some(b"hello"), Some("text/plain"));
        let b = derive_key("GET", "/m/x", Some(b"world"), Some("text/plain"));
        assert_eq!(a, b);
    }
}
