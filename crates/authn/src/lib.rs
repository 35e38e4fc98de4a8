//! # Warden Authentication
//!
//! Signing key lifecycle and bearer token verification.
//!
//! This crate provides:
//! - **Key store**: per-tenant Ed25519 key pairs with rotation, publication and expiry sweeps
//! - **Key set cache**: read-mostly snapshot cache with single-flight refresh and bounded staleness
//! - **Token verifier**: structure, signature, temporal, issuer, audience and tenant checks
//! - **JWKS**: published key sets as JWKS documents, plus an HTTP key set source
//!
//! ## Security
//!
//! - Only `EdDSA` is accepted; `none` and HMAC algorithms are rejected before any key lookup
//! - A token bound to another tenant is always rejected
//! - Clients only ever see a generic rejection message
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_authn::{KeySetCache, KeySetSource, KeyStore, TokenVerifier};
//! use warden_storage::{KeyRecordStore, MemoryKeyRecordStore, TenantId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = KeyStore::builder()
//!     .store(Arc::new(MemoryKeyRecordStore::new()) as Arc<dyn KeyRecordStore>)
//!     .build();
//! let tenant = TenantId::from("acme");
//! keys.rotate(&tenant).await?;
//!
//! let cache = KeySetCache::builder().source(Arc::new(keys) as Arc<dyn KeySetSource>).build();
//! let verifier = TokenVerifier::builder().cache(Arc::new(cache)).build();
//!
//! let token = "eyJhbGciOiJFZERTQSIsImtpZCI6Ii4uLiJ9...";
//! let identity = verifier.verify(token, &tenant, "api").await?;
//! println!("verified {}", identity.subject_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: exposes [`testutil`] (key pair and token helpers, scriptable key set source)
//! - **`failpoints`**: enables the `key-set-fetch` fail point

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Key store, key set cache and verifier configuration.
pub mod config;
/// Verification and key lifecycle errors.
pub mod error;
/// JWKS documents and the HTTP key set source.
pub mod jwks;
/// Token wire format.
pub mod jwt;
/// Per-tenant key set cache.
pub mod key_set_cache;
/// Signing key lifecycle.
pub mod key_store;
mod tenant_lock;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Algorithm and key id validation.
pub mod validation;
/// Bearer token verification.
pub mod verifier;

pub use config::{KeySetCacheConfig, KeyStoreConfig, VerifierConfig};
pub use error::{KeyError, Result, VerificationError, VerificationErrorKind};
pub use jwks::{HttpKeySetSource, Jwk, JwkSet, cache_control_header, parse_max_age};
pub use jwt::TokenClaims;
pub use key_set_cache::{KeySetCache, KeySetCacheMetrics, KeySetSource};
pub use key_store::{
    GeneratedKeyPair, KeyExpirySweeper, KeyMaterialProvider, KeyStore, KeySweepReport,
    OsRngKeyMaterial, PublishedKey, PublishedKeySet,
};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use verifier::{RequestContext, TokenVerifier, VerifiedIdentity, VerifierMetrics};
