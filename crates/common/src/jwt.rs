//! JWT utilities shared across Token Guard components.
//!
//! This module provides the structural half of JWT validation:
//! - Size limits for DoS prevention
//! - Clock skew constants for time-claim validation
//! - Splitting and decoding a compact JWT into header, claims and signature
//! - `exp` / `nbf` validation logic
//!
//! Nothing here verifies a signature. A [`RawToken`] is untrusted until the
//! caller has checked its signature against a key from a trusted JWKS.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Generic error messages prevent information leakage
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{RawToken, validate_exp, DEFAULT_CLOCK_SKEW};
//!
//! let raw = RawToken::parse(token)?;
//! let kid = raw.kid()?;
//! // ... resolve key, verify raw.signing_input() against raw.signature() ...
//! if let Some(exp) = raw.time_claim("exp")? {
//!     validate_exp(exp, DEFAULT_CLOCK_SKEW)?;
//! }
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// JWTs larger than this are rejected BEFORE any base64 decoding or
/// cryptographic work.
///
/// # Rationale
///
/// - Typical RS256 access tokens are 700-1200 bytes
/// - 8KB leaves room for large custom claim sets
/// - An attacker sending a 10MB token is rejected with no allocation
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default clock skew tolerance for `exp` / `nbf` checks.
///
/// Zero: a token is expired the second its `exp` passes.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(0);

/// Maximum allowed clock skew tolerance (10 minutes).
///
/// Caps misconfiguration that would otherwise keep expired tokens alive.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during structural JWT validation.
///
/// Note: Error messages are intentionally generic to prevent information leakage.
/// Detailed information is logged at debug level for troubleshooting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is missing required `kid` header.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token `exp` claim is in the past.
    #[error("The access token is invalid or expired")]
    Expired,

    /// Token `nbf` claim is in the future.
    #[error("The access token is invalid or expired")]
    NotYetValid,
}

// =============================================================================
// Token Types
// =============================================================================

/// Decoded JOSE header of a compact JWT.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtHeader {
    /// Declared signing algorithm (e.g. "RS256"). Untrusted until checked
    /// against an allow-list.
    pub alg: String,

    /// Key ID used to select the verification key.
    #[serde(default)]
    pub kid: Option<Value>,

    /// Token type, usually "JWT".
    #[serde(default)]
    pub typ: Option<String>,
}

/// A compact JWT split into its decoded parts.
///
/// Borrowed from the caller's token string; never persisted.
#[derive(Debug, Clone)]
pub struct RawToken<'a> {
    header: JwtHeader,
    claims: Map<String, Value>,
    signing_input: &'a str,
    signature: &'a str,
}

impl<'a> RawToken<'a> {
    /// Split and decode a compact JWT without verifying its signature.
    ///
    /// # Errors
    ///
    /// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
    /// - `MalformedToken` - Wrong number of segments, bad base64url, header
    ///   or payload not a JSON object, or empty signature
    pub fn parse(token: &'a str) -> Result<Self, JwtValidationError> {
        // Check token size first (DoS prevention)
        if token.len() > MAX_JWT_SIZE_BYTES {
            tracing::debug!(
                target: "common.jwt",
                token_size = token.len(),
                max_size = MAX_JWT_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(JwtValidationError::TokenTooLarge);
        }

        // JWT format: header.payload.signature
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or(JwtValidationError::MalformedToken)?;
        let (header_part, payload_part) = signing_input
            .split_once('.')
            .ok_or(JwtValidationError::MalformedToken)?;

        if payload_part.contains('.') || signature.is_empty() {
            tracing::debug!(
                target: "common.jwt",
                parts = token.split('.').count(),
                "Token rejected: invalid JWT format"
            );
            return Err(JwtValidationError::MalformedToken);
        }

        let header: JwtHeader = decode_segment(header_part, "header")?;
        let claims: Map<String, Value> = decode_segment(payload_part, "payload")?;

        Ok(Self {
            header,
            claims,
            signing_input,
            signature,
        })
    }

    /// The decoded header.
    #[must_use]
    pub fn header(&self) -> &JwtHeader {
        &self.header
    }

    /// The header's declared algorithm name.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.header.alg
    }

    /// Extract the `kid` (key ID) from the header.
    ///
    /// # Errors
    ///
    /// Returns `MissingKid` if the header has no `kid`, or it is not a
    /// non-empty string.
    pub fn kid(&self) -> Result<&str, JwtValidationError> {
        // Reject empty values for defense-in-depth
        self.header
            .kid
            .as_ref()
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(JwtValidationError::MissingKid)
    }

    /// The decoded payload.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Consume the token, keeping only the decoded payload.
    #[must_use]
    pub fn into_claims(self) -> Map<String, Value> {
        self.claims
    }

    /// `header.payload` exactly as it appeared on the wire (the signed bytes).
    #[must_use]
    pub fn signing_input(&self) -> &'a str {
        self.signing_input
    }

    /// The base64url signature segment.
    #[must_use]
    pub fn signature(&self) -> &'a str {
        self.signature
    }

    /// Read a NumericDate claim such as `exp` or `nbf`.
    ///
    /// Returns `Ok(None)` when the claim is absent.
    ///
    /// # Errors
    ///
    /// Returns `MalformedToken` if the claim is present but not a number.
    pub fn time_claim(&self, name: &str) -> Result<Option<i64>, JwtValidationError> {
        match self.claims.get(name) {
            None => Ok(None),
            Some(value) => numeric_date(value).map(Some).ok_or_else(|| {
                tracing::debug!(target: "common.jwt", claim = name, "Time claim is not numeric");
                JwtValidationError::MalformedToken
            }),
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Base64url-decode one JWT segment and deserialize it as JSON.
fn decode_segment<T: DeserializeOwned>(
    segment: &str,
    part: &'static str,
) -> Result<T, JwtValidationError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        tracing::debug!(target: "common.jwt", part, error = %e, "Failed to decode JWT base64");
        JwtValidationError::MalformedToken
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", part, error = %e, "Failed to parse JWT JSON");
        JwtValidationError::MalformedToken
    })
}

/// NumericDate per RFC 7519: integral or fractional seconds since the epoch.
#[allow(clippy::cast_possible_truncation)]
fn numeric_date(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Validate the `exp` (expiration) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::Expired` if `exp + clock_skew` is not in
/// the future.
pub fn validate_exp(exp: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_exp_at(exp, clock_skew, now)
}

/// Deterministic `exp` validation against an explicit `now` timestamp.
///
/// Prefer [`validate_exp`] in production code. This variant exists so that
/// boundary conditions can be unit-tested without wall-clock dependence.
pub fn validate_exp_at(exp: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    let clock_skew_secs = skew_secs(clock_skew);

    if now >= exp.saturating_add(clock_skew_secs) {
        tracing::debug!(
            target: "common.jwt",
            exp = exp,
            now = now,
            clock_skew_secs = clock_skew_secs,
            "Token rejected: expired"
        );
        return Err(JwtValidationError::Expired);
    }

    Ok(())
}

/// Validate the `nbf` (not-before) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::NotYetValid` if `nbf` is more than
/// `clock_skew` in the future.
pub fn validate_nbf(nbf: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_nbf_at(nbf, clock_skew, now)
}

/// Deterministic `nbf` validation against an explicit `now` timestamp.
pub fn validate_nbf_at(nbf: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    let clock_skew_secs = skew_secs(clock_skew);
    let latest_allowed = now.saturating_add(clock_skew_secs);

    if nbf > latest_allowed {
        tracing::debug!(
            target: "common.jwt",
            nbf = nbf,
            now = now,
            max_allowed = latest_allowed,
            "Token rejected: not yet valid"
        );
        return Err(JwtValidationError::NotYetValid);
    }

    Ok(())
}

// Safe cast: clock skew is bounded to MAX_CLOCK_SKEW by configuration
#[allow(clippy::cast_possible_wrap)]
fn skew_secs(clock_skew: Duration) -> i64 {
    clock_skew.as_secs() as i64
}

// =============================================================================
// Tests
// =============================================================================
