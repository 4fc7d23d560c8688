//! Token Guard error types.
//!
//! Every [`VerifyError`] renders the same generic message, so a caller that
//! forwards `Display` to a client cannot reveal which check rejected the
//! token. The precise kind is available through [`VerifyError::kind`] for
//! logs and metrics.

use common::jwt::JwtValidationError;
use thiserror::Error;

/// Reason a token was rejected.
///
/// Exactly one variant is returned per verification: the first failing
/// check wins and later checks are not evaluated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Not three base64url segments of JSON, oversized, or missing `kid`.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Header `alg` is outside the policy allow-list.
    #[error("The access token is invalid or expired")]
    AlgorithmNotAllowed,

    /// No key with the token's `kid` exists, even after a refresh.
    #[error("The access token is invalid or expired")]
    KeyNotFound,

    /// A refresh was needed but the JWKS fetch budget is exhausted.
    #[error("The access token is invalid or expired")]
    RateLimited,

    /// The JWKS endpoint was unreachable or returned an unusable document.
    #[error("The access token is invalid or expired")]
    FetchFailed,

    /// Signature does not verify with the resolved key.
    #[error("The access token is invalid or expired")]
    InvalidSignature,

    /// `exp` is in the past.
    #[error("The access token is invalid or expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("The access token is invalid or expired")]
    NotYetValid,

    /// `iss` does not equal the expected issuer.
    #[error("The access token is invalid or expired")]
    IssuerMismatch,

    /// `aud` neither equals nor contains the expected audience.
    #[error("The access token is invalid or expired")]
    AudienceMismatch,

    /// The policy names a JWKS endpoint other than the one the key store
    /// fetches from. Nothing is parsed or fetched.
    #[error("The access token is invalid or expired")]
    EndpointMismatch,
}

impl VerifyError {
    /// Stable, bounded label for logs and the `error_type` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::MalformedToken => "malformed_token",
            VerifyError::AlgorithmNotAllowed => "algorithm_not_allowed",
            VerifyError::KeyNotFound => "key_not_found",
            VerifyError::RateLimited => "rate_limited",
            VerifyError::FetchFailed => "fetch_failed",
            VerifyError::InvalidSignature => "invalid_signature",
            VerifyError::Expired => "expired",
            VerifyError::NotYetValid => "not_yet_valid",
            VerifyError::IssuerMismatch => "issuer_mismatch",
            VerifyError::AudienceMismatch => "audience_mismatch",
            VerifyError::EndpointMismatch => "endpoint_mismatch",
        }
    }
}

impl From<JwtValidationError> for VerifyError {
    fn from(err: JwtValidationError) -> Self {
        match err {
            JwtValidationError::TokenTooLarge
            | JwtValidationError::MalformedToken
            | JwtValidationError::MissingKid => VerifyError::MalformedToken,
            JwtValidationError::Expired => VerifyError::Expired,
            JwtValidationError::NotYetValid => VerifyError::NotYetValid,
        }
    }
}

impl From<KeyStoreError> for VerifyError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::KeyNotFound => VerifyError::KeyNotFound,
            KeyStoreError::RateLimited => VerifyError::RateLimited,
            KeyStoreError::FetchFailed(_) => VerifyError::FetchFailed,
        }
    }
}

/// Failure of a single JWKS round-trip.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection failure, timeout, or non-success status.
    #[error("JWKS request failed: {0}")]
    Network(String),

    /// Body is not a JWKS document or contains no usable keys.
    #[error("Malformed JWKS response: {0}")]
    MalformedResponse(String),
}

/// Failure to resolve a signing key.
///
/// `Clone` so that callers coalesced onto one refresh can all receive its
/// outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("Signing key not found")]
    KeyNotFound,

    #[error("JWKS refresh rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    FetchFailed(#[from] FetchError),
}
