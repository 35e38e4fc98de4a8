//! Token wire format.
//!
//! A token is three dot-separated base64url segments: a header naming the
//! algorithm and key id, a claims payload, and an Ed25519 signature. The
//! helpers here split that apart without trusting it ([`parse_unverified`]),
//! produce it ([`sign`]), and check the signature against one key
//! ([`verify_signature`]). Temporal, issuer, audience and tenant checks are
//! the verifier's job.
//!
//! ```json
//! {
//!   "iss": "https://auth.warden.example",
//!   "sub": "user-42",
//!   "aud": "api",
//!   "exp": 1704068100,
//!   "iat": 1704067200,
//!   "jti": "6f1c...",
//!   "tenant_id": "acme",
//!   "sid": "s-9",
//!   "permissions": ["billing:read"]
//! }
//! ```

use std::collections::HashSet;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, VerifyingKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use warden_storage::{KeyId, SessionId, TenantId, Zeroizing};

use crate::{
    error::{KeyError, VerificationError},
    validation::{validate_algorithm, validate_kid},
};

/// Token header fields the verifier reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenHeader {
    /// Algorithm name, kept as a string so that unknown values can be
    /// reported rather than failing to parse.
    pub alg: String,
    /// Signing key id.
    #[serde(default)]
    pub kid: Option<String>,
    /// Media type, usually `JWT`.
    #[serde(default)]
    pub typ: Option<String>,
}

/// Claims carried by access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject the token was issued to.
    pub sub: String,
    /// Intended audience.
    pub aud: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issue time, seconds since the epoch.
    pub iat: i64,
    /// Not-before, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Token id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Tenant the token is bound to.
    pub tenant_id: TenantId,
    /// Session the token belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<SessionId>,
    /// Permissions granted at issue time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// A token split into its parts, nothing verified yet beyond shape,
/// algorithm and key id format.
#[derive(Debug, Clone)]
pub struct UnverifiedToken {
    /// Decoded header.
    pub header: TokenHeader,
    /// Validated key id from the header.
    pub kid: KeyId,
    /// Decoded, untrusted claims.
    pub claims: TokenClaims,
}

fn segments(token: &str) -> Result<[&str; 3], VerificationError> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() =>
        {
            Ok([header, payload, signature])
        },
        _ => Err(VerificationError::malformed("token must have 3 parts separated by dots")),
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(
    segment: &str,
    name: &str,
) -> Result<T, VerificationError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| VerificationError::malformed(format!("failed to decode {name}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VerificationError::malformed(format!("failed to parse {name}: {e}")))
}

/// Decodes the header without verification.
///
/// # Errors
///
/// [`VerificationError::MalformedToken`] if the token shape or header JSON
/// is invalid.
pub fn decode_header(token: &str) -> Result<TokenHeader, VerificationError> {
    let [header, _, _] = segments(token)?;
    decode_segment(header, "header")
}

/// Decodes the claims without verification.
///
/// # Errors
///
/// [`VerificationError::MalformedToken`] if the payload is not valid claims
/// JSON or a required claim is empty.
pub fn decode_claims(token: &str) -> Result<TokenClaims, VerificationError> {
    let [_, payload, _] = segments(token)?;
    let claims: TokenClaims = decode_segment(payload, "claims")?;

    for (name, value) in
        [("iss", claims.iss.as_str()), ("sub", claims.sub.as_str()), ("aud", claims.aud.as_str())]
    {
        if value.is_empty() {
            return Err(VerificationError::malformed(format!("missing claim: {name}")));
        }
    }
    if claims.tenant_id.as_str().is_empty() {
        return Err(VerificationError::malformed("missing claim: tenant_id"));
    }
    Ok(claims)
}

/// Splits a token and runs every check that needs no key.
///
/// # Errors
///
/// - [`VerificationError::MalformedToken`] for a bad shape, missing or invalid `kid`, or bad claims
/// - [`VerificationError::UnsupportedAlgorithm`] for anything but `EdDSA`
pub fn parse_unverified(token: &str) -> Result<UnverifiedToken, VerificationError> {
    let header = decode_header(token)?;
    validate_algorithm(&header.alg)?;

    let kid = header
        .kid
        .clone()
        .ok_or_else(|| VerificationError::malformed("header missing 'kid' field"))?;
    validate_kid(&kid)?;

    let claims = decode_claims(token)?;
    Ok(UnverifiedToken { header, kid: KeyId::from(kid), claims })
}

/// Signs `claims` with a PKCS#8 DER Ed25519 private key.
///
/// # Errors
///
/// [`KeyError::Signing`] if the key material is unusable.
pub fn sign(claims: &TokenClaims, kid: &KeyId, private_der: &[u8]) -> Result<String, KeyError> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(kid.to_string());

    let encoding_key = EncodingKey::from_ed_der(private_der);
    jsonwebtoken::encode(&header, claims, &encoding_key)
        .map_err(|e| KeyError::Signing(e.to_string()))
}

/// Checks the signature against one key and returns the claims.
///
/// Only the signature is checked here.
///
/// # Errors
///
/// - [`VerificationError::SignatureMismatch`] if the key did not sign the token
/// - [`VerificationError::MalformedToken`] for anything jsonwebtoken rejects structurally
pub fn verify_signature(token: &str, key: &DecodingKey) -> Result<TokenClaims, VerificationError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = jsonwebtoken::decode::<TokenClaims>(token, key, &validation)?;
    Ok(data.claims)
}

/// Builds a decoding key from a base64url Ed25519 public key.
///
/// # Errors
///
/// [`KeyError::InvalidPublicKey`] if the value is not 32 bytes of a valid
/// curve point.
pub fn decoding_key(public_key_b64: &str) -> Result<DecodingKey, KeyError> {
    let bytes: Zeroizing<Vec<u8>> = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(public_key_b64.as_bytes())
            .map_err(|e| KeyError::InvalidPublicKey(format!("base64 decode: {e}")))?,
    );

    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        KeyError::InvalidPublicKey(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| KeyError::InvalidPublicKey(format!("invalid Ed25519 key: {e}")))?;

    DecodingKey::from_ed_components(public_key_b64)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}
