//! # Warden Session
//!
//! Session issuance and refresh token rotation for the Warden credential
//! core.
//!
//! A session pairs a short-lived signed access token with a long-lived
//! opaque refresh token. Every refresh rotates the pair; presenting a
//! refresh token that was already rotated revokes the whole session and
//! emits a high-risk audit event.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_authn::KeyStore;
//! use warden_session::SessionManager;
//! use warden_storage::{
//!     KeyRecordStore, MemoryKeyRecordStore, MemorySessionStore, SessionStore, SubjectId, TenantId,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = KeyStore::builder()
//!     .store(Arc::new(MemoryKeyRecordStore::new()) as Arc<dyn KeyRecordStore>)
//!     .build();
//! let tenant = TenantId::from("acme");
//! keys.rotate(&tenant).await?;
//!
//! let sessions = SessionManager::builder()
//!     .store(Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>)
//!     .key_store(keys)
//!     .build();
//!
//! let issued = sessions.issue(&tenant, &SubjectId::from("user-42"), "password").await?;
//! let rotated = sessions.refresh(&issued.refresh_token).await?;
//! assert_ne!(rotated.refresh_token, issued.refresh_token);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: enables the test helpers of the storage, audit and authn crates.
//! - **`failpoints`**: activates the `session-refresh-cas` and `session-revoke-cas` fail points.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod manager;

pub use config::SessionConfig;
pub use error::{Result, SessionError, SessionErrorKind};
pub use manager::{
    IssuedTokens, REUSE_REVOCATION_REASON, REUSE_RISK_FLOOR, SessionManager, hash_refresh_token,
};
