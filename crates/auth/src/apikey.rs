//! API-key extraction and verification.
//!
//! Credentials are looked for in a fixed priority order, stopping at the
//! first non-empty source: `Authorization: Bearer`, `x-api-key`,
//! `x-goog-api-key`, then the `key` query parameter. The matched key's
//! logical name is what gets recorded in the request context and in usage
//! records — never the key itself.

use std::collections::HashMap;

use axum::http::HeaderMap;

use modelrelay_core::error::GatewayError;

/// Configured key map: secret key value → logical key name.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, String>,
}

impl ApiKeyStore {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Parse the `name:key,name:key,…` environment format. Malformed
    /// entries are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((name, key)) = entry.split_once(':')
                && !name.is_empty()
                && !key.is_empty()
            {
                keys.insert(key.to_string(), name.to_string());
            }
        }
        Self { keys }
    }

    /// From a name → key map (the config file shape).
    pub fn from_named(named: &HashMap<String, String>) -> Self {
        Self {
            keys: named.iter().map(|(name, key)| (key.clone(), name.clone())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Verify a presented key; returns the logical key name on match.
    pub fn verify(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    /// Run the full extraction + verification chain for one request.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<String, GatewayError> {
        let credential = extract_credential(headers, query).ok_or(GatewayError::AuthMissing)?;
        self.verify(&credential)
            .map(str::to_string)
            .ok_or(GatewayError::AuthInvalid)
    }
}

/// Pull the credential out of a request, honoring the priority order.
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
    {
        return Some(bearer.to_string());
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Some(value.to_string());
        }
    }
    query_param(query?, "key")
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}
