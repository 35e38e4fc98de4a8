//! JSON Web Key Set representation of published keys.
//!
//! [`PublishedKeySet::to_jwks`] renders a tenant's verification keys as an
//! RFC 8037 OKP key set for `/.well-known`-style endpoints, and
//! [`HttpKeySetSource`] reads such a document back so that a verifier can
//! run in a different process from the key store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_storage::{KeyAlgorithm, KeyId, StorageError, StorageResult, TenantId};

use crate::{
    key_set_cache::KeySetSource,
    key_store::{PublishedKey, PublishedKeySet},
};

/// One OKP public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, `OKP` for Ed25519.
    pub kty: String,
    /// Curve, `Ed25519`.
    pub crv: String,
    /// Algorithm, `EdDSA`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Intended use, `sig`.
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// Key id.
    pub kid: String,
    /// Raw public key, base64url without padding.
    pub x: String,
    /// Verification deadline (seconds since the epoch) for a retiring key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// A JSON Web Key Set document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    pub keys: Vec<Jwk>,
}

impl From<&PublishedKey> for Jwk {
    fn from(key: &PublishedKey) -> Self {
        Self {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            alg: Some(key.algorithm.to_string()),
            key_use: Some("sig".into()),
            kid: key.key_id.to_string(),
            x: key.public_key.clone(),
            exp: key.expires_at.map(|t| t.timestamp()),
        }
    }
}

impl PublishedKeySet {
    /// Renders the set as a JWKS document.
    #[must_use]
    pub fn to_jwks(&self) -> JwkSet {
        JwkSet { keys: self.keys.iter().map(Jwk::from).collect() }
    }

    /// Rebuilds a set from a JWKS document.
    ///
    /// Keys that are not Ed25519 are skipped with a warning.
    #[must_use]
    pub fn from_jwks(
        tenant_id: TenantId,
        jwks: JwkSet,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let keys = jwks
            .keys
            .into_iter()
            .filter_map(|jwk| {
                if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                    tracing::warn!(kid = %jwk.kid, kty = %jwk.kty, crv = %jwk.crv, "skipping non-Ed25519 key");
                    return None;
                }
                Some(PublishedKey {
                    key_id: KeyId::from(jwk.kid),
                    algorithm: KeyAlgorithm::EdDSA,
                    public_key: jwk.x,
                    expires_at: jwk.exp.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                })
            })
            .collect();
        Self { tenant_id, keys, fetched_at, ttl }
    }
}

/// `Cache-Control` value advertising `ttl`.
#[must_use]
pub fn cache_control_header(ttl: Duration) -> String {
    format!("public, max-age={}", ttl.as_secs())
}

/// Reads `max-age` from a `Cache-Control` value.
#[must_use]
pub fn parse_max_age(header: &str) -> Option<Duration> {
    header.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().parse().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

/// Fetches key sets from `{base_url}/{tenant_id}/jwks.json`.
///
/// The response's `Cache-Control: max-age` sets the snapshot TTL; without
/// one the configured default applies.
#[derive(Debug, Clone)]
pub struct HttpKeySetSource {
    client: reqwest::Client,
    base_url: String,
    default_ttl: Duration,
}

#[bon::bon]
impl HttpKeySetSource {
    /// Creates a source.
    #[builder]
    pub fn new(
        #[builder(into)] base_url: String,
        #[builder(default = crate::config::DEFAULT_KEY_SET_TTL)] default_ttl: Duration,
        #[builder(default)] client: reqwest::Client,
    ) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_owned(), default_ttl }
    }

    /// The tenant id becomes one percent-encoded path segment, so it can
    /// never climb out of `base_url`.
    fn url(&self, tenant_id: &TenantId) -> StorageResult<reqwest::Url> {
        let tenant = tenant_id.as_str();
        // Dot segments are dropped by the URL serializer rather than encoded.
        if tenant.is_empty() || tenant == "." || tenant == ".." {
            return Err(StorageError::not_found(format!("key set for tenant {tenant:?}")));
        }
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| StorageError::internal(format!("invalid key set base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| StorageError::internal("key set base url cannot have a path"))?
            .pop_if_empty()
            .push(tenant)
            .push("jwks.json");
        Ok(url)
    }
}

fn map_request_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() {
        StorageError::timeout()
    } else if err.is_decode() {
        StorageError::serialization_with_source(err.to_string(), err)
    } else {
        StorageError::connection_with_source(err.to_string(), err)
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet> {
        let url = self.url(tenant_id)?;
        let response = self.client.get(url.clone()).send().await.map_err(map_request_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::not_found(url.as_str()));
        }
        if status.is_server_error() {
            return Err(StorageError::connection(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(StorageError::internal(format!("{url} returned {status}")));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(self.default_ttl);

        let jwks: JwkSet = response.json().await.map_err(map_request_error)?;
        tracing::debug!(keys = jwks.keys.len(), ttl_secs = ttl.as_secs(), "fetched key set");
        Ok(PublishedKeySet::from_jwks(tenant_id.clone(), jwks, Utc::now(), ttl))
    }
}
