//! Header checks applied before any key lookup.
//!
//! # Security
//!
//! - Only `EdDSA` is accepted, so an attacker cannot pick the algorithm used to check their token
//! - `none` and the HMAC family are always rejected, with a distinct message
//! - Key ids are bounded in length and charset before they reach a cache key or a URL

use crate::error::VerificationError;

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, so a published key would double as a signing secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms the verifier can check end to end.
///
/// Keys are Ed25519 only; per RFC 8725 §3.1 anything the verifier cannot
/// fully check is refused up front.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA"];

/// Longest accepted `kid`.
pub const MAX_KID_LENGTH: usize = 128;

/// Checks the header algorithm.
///
/// # Errors
///
/// [`VerificationError::UnsupportedAlgorithm`] for a forbidden or unlisted
/// algorithm.
///
/// ```
/// use warden_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("RS256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), VerificationError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(alg)) {
        return Err(VerificationError::UnsupportedAlgorithm(format!(
            "algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(VerificationError::UnsupportedAlgorithm(format!(
            "algorithm '{alg}' is not in accepted list (only EdDSA is supported)"
        )));
    }

    Ok(())
}

/// Checks a key id taken from an untrusted header.
///
/// Accepts 1 to [`MAX_KID_LENGTH`] characters from `[A-Za-z0-9._-]`.
///
/// # Errors
///
/// [`VerificationError::MalformedToken`] otherwise.
pub fn validate_kid(kid: &str) -> Result<(), VerificationError> {
    if kid.is_empty() {
        return Err(VerificationError::malformed("kid is empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(VerificationError::malformed(format!(
            "kid exceeds {MAX_KID_LENGTH} characters"
        )));
    }
    if !kid.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')) {
        return Err(VerificationError::malformed("kid contains disallowed characters"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_eddsa_accepted() {
        assert!(validate_algorithm("EdDSA").is_ok());
    }

    #[test]
    fn test_forbidden_algorithms_rejected_with_security_message() {
        for alg in FORBIDDEN_ALGORITHMS {
            let result = validate_algorithm(alg);
            assert!(
                matches!(result, Err(VerificationError::UnsupportedAlgorithm(ref msg)) if msg.contains("security reasons")),
                "expected security rejection for '{alg}'"
            );
        }
    }

    #[test]
    fn test_case_variants_of_none_rejected() {
        for alg in ["None", "NONE", "hs256"] {
            assert!(validate_algorithm(alg).is_err(), "{alg}");
        }
    }

    #[rstest]
    #[case("RS256")]
    #[case("ES256")]
    #[case("PS512")]
    fn test_unlisted_algorithms_rejected(#[case] alg: &str) {
        let result = validate_algorithm(alg);
        assert!(
            matches!(result, Err(VerificationError::UnsupportedAlgorithm(ref msg)) if msg.contains("not in accepted list"))
        );
    }

    #[rstest]
    #[case("20240101000000-1a2b3c4d", true)]
    #[case("key_v2.primary", true)]
    #[case("", false)]
    #[case("../../etc/passwd", false)]
    #[case("kid\u{0}", false)]
    #[case("kid with space", false)]
    fn test_validate_kid(#[case] kid: &str, #[case] ok: bool) {
        assert_eq!(validate_kid(kid).is_ok(), ok, "{kid:?}");
    }

    #[test]
    fn test_kid_length_bound() {
        assert!(validate_kid(&"a".repeat(MAX_KID_LENGTH)).is_ok());
        assert!(validate_kid(&"a".repeat(MAX_KID_LENGTH + 1)).is_err());
    }

    proptest! {
        #[test]
        fn accepted_kids_never_contain_path_separators(kid in "\\PC{0,64}") {
            if validate_kid(&kid).is_ok() {
                prop_assert!(!kid.contains('/'));
                prop_assert!(!kid.contains('\\'));
            }
        }
    }
}
