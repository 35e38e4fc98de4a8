//! Storage contracts and record types for the Warden credential core.
//!
//! Every component that persists state does so through a trait defined
//! here, so production backends and the in-memory stores used by tests are
//! interchangeable.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │   KeyStore · TokenVerifier · SessionManager · AuditEngine   │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        KeyRecordStore        │         SessionStore         │
//! │   (per-tenant signing keys)  │  (versioned CAS, hash index) │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │      StorageError · RetryConfig/with_retry · Clock          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: exposes [`testutil`] (deterministic clocks, a store with injectable read
//!   failures, assertion macros).
//! - **`failpoints`**: activates `fail` points in the in-memory stores.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod error;
pub mod keys;
pub mod retry;
pub mod session;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use keys::{KeyAlgorithm, KeyRecordStore, KeyState, MemoryKeyRecordStore, SigningKeyRecord};
pub use retry::{RetryConfig, compute_backoff, with_retry};
pub use session::{MemorySessionStore, RotatedRefreshHash, SessionRecord, SessionStore};
pub use types::{KeyId, SessionId, SubjectId, TenantId};
pub use zeroize::Zeroizing;
