use std::sync::Arc;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use tokio::time::Instant;

use crate::snapshot::{Credential, Snapshot};

/// Header Anthropic clients send their key in.
const API_KEY_HEADER: &str = "x-api-key";

/// What the front door established about a request before it reaches the pipeline.
///
/// The snapshot is the one the credential was authenticated against. The pipeline uses it for
/// the rest of the request, so a reload in between never mixes two configurations.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub snapshot: Arc<Snapshot>,
    pub credential: Arc<Credential>,
    /// When the request arrived. Timeouts count from here.
    pub started: Instant,
}

impl RequestContext {
    pub fn new(snapshot: Arc<Snapshot>, credential: Arc<Credential>) -> Self {
        Self {
            snapshot,
            credential,
            started: Instant::now(),
        }
    }
}

/// The client's API key, from `Authorization: Bearer` or `x-api-key`.
///
/// A malformed `Authorization` header yields no key rather than falling through.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let (scheme, key) = value.split_once(' ')?;

        return scheme.eq_ignore_ascii_case("bearer").then(|| key.trim()).filter(|key| !key.is_empty());
    }

    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_and_api_key_headers() {
        assert_eq!(extract_api_key(&headers("authorization", "Bearer secret")), Some("secret"));
        assert_eq!(extract_api_key(&headers("authorization", "bearer  secret ")), Some("secret"));
        assert_eq!(extract_api_key(&headers("x-api-key", "secret")), Some("secret"));
    }

    #[test]
    fn malformed_authorization_yields_nothing() {
        assert_eq!(extract_api_key(&headers("authorization", "Basic c2VjcmV0")), None);
        assert_eq!(extract_api_key(&headers("authorization", "Bearer")), None);
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
