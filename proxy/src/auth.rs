use crate::identity::CallerIdentity;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use http::request::Parts;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Establishes who a request is made for. The identity must come from something the caller can
/// not forge, never from a header that is simply trusted as-is.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, parts: &Parts) -> Option<CallerIdentity>;

    /// Removes whatever credential `authenticate` consumed, so it is not forwarded upstream.
    fn strip_credentials(&self, _headers: &mut HeaderMap) {}
}

/// Uses the identity an outer layer (session middleware, embedding server) already attached to
/// the request extensions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtensionIdentity;

impl Authenticator for ExtensionIdentity {
    fn authenticate(&self, parts: &Parts) -> Option<CallerIdentity> {
        parts.extensions.get::<CallerIdentity>().cloned()
    }
}

/// One configured api key: the hex SHA-256 digest of the token and the identity it maps to.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiKeyConfig {
    pub key_sha256: String,
    pub identity: CallerIdentity,
}

/// Bearer token authentication against a fixed set of hashed api keys.
#[derive(Clone, Debug, Default)]
pub struct ApiKeys {
    keys: HashMap<String, CallerIdentity>,
}

impl ApiKeys {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        ApiKeys {
            keys: keys
                .into_iter()
                .map(|k| (k.key_sha256.to_ascii_lowercase(), k.identity))
                .collect(),
        }
    }

    pub fn hash_key(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }
}

impl Authenticator for ApiKeys {
    fn authenticate(&self, parts: &Parts) -> Option<CallerIdentity> {
        let token = parts
            .headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .trim();

        self.keys.get(&Self::hash_key(token)).cloned()
    }

    fn strip_credentials(&self, headers: &mut HeaderMap) {
        headers.remove(AUTHORIZATION);
    }
}
