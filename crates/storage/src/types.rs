//! Identifier newtypes shared by every crate in the workspace.
//!
//! Tenants, subjects, keys and sessions are all addressed by opaque strings.
//! Wrapping each in its own type turns "passed a subject id where a tenant
//! id was expected" into a compile error.

/// Defines a transparent `String` newtype with the usual conversions.
///
/// Each generated type:
/// - derives `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - serializes transparently as its inner string
/// - implements `From<String>`, `From<&str>`, `AsRef<str>` and `Display`
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from anything string-like.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_id!(
    /// Tenant owning keys, sessions and audit history.
    ///
    /// ```
    /// use warden_storage::TenantId;
    ///
    /// let tenant = TenantId::from("acme");
    /// assert_eq!(tenant.as_str(), "acme");
    /// assert_eq!(tenant.to_string(), "acme");
    /// ```
    TenantId
);

define_id!(
    /// User or service principal a token was issued to.
    SubjectId
);

define_id!(
    /// Signing key identifier, carried in the token header as `kid`.
    KeyId
);

define_id!(
    /// Session identifier, carried in access tokens as `sid`.
    SessionId
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_serializes_transparently() {
        let id = KeyId::new("k-2024-01");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"k-2024-01\"");
        let back: KeyId = serde_json::from_str("\"k-2024-01\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_hash_and_eq_follow_inner_value() {
        let mut set = HashSet::new();
        set.insert(TenantId::from("a"));
        set.insert(TenantId::from(String::from("a")));
        set.insert(TenantId::from("b"));
        assert_eq!(set.len(), 2);
    }
}
