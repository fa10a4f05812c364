//! Carrier traits for trace context propagation.
//!
//! Carriers abstract the transport a context rides on. Implementations exist
//! for `http::HeaderMap` (the real transport) and `HashMap<String, String>`
//! (tests and in-memory hand-off). Keys are case-insensitive in both.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Write side of a carrier.
pub trait Injector {
    /// Set `key` to `value`, replacing any previous value.
    fn set(&mut self, key: &str, value: String);
}

/// Read side of a carrier.
pub trait Extractor {
    /// Value for `key`, if present and valid text.
    fn get(&self, key: &str) -> Option<&str>;

    /// All keys, lowercase.
    fn keys(&self) -> Vec<&str>;
}

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes());
        let value = HeaderValue::from_str(&value);
        if let (Ok(name), Ok(value)) = (name, value) {
            self.insert(name, value);
        } else {
            tracing::debug!(key = %key, "Dropping header that is not valid HTTP");
        }
    }
}

impl Extractor for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(HeaderName::as_str).collect()
    }
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("TraceParent", "value".to_string());

        assert_eq!(Extractor::get(&headers, "traceparent"), Some("value"));
        assert_eq!(Extractor::get(&headers, "TRACEPARENT"), Some("value"));
        assert_eq!(Extractor::keys(&headers), vec!["traceparent"]);
    }

    #[test]
    fn test_header_map_rejects_invalid_value() {
        let mut headers = HeaderMap::new();
        headers.set("traceparent", "bad\nvalue".to_string());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_hash_map_case_insensitive() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set("Uber-Trace-Id", "value".to_string());

        assert_eq!(Extractor::get(&carrier, "UBER-TRACE-ID"), Some("value"));
        assert_eq!(Extractor::keys(&carrier), vec!["uber-trace-id"]);
    }
}
