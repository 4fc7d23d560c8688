//! Bearer token verification.
//!
//! Verifies JWTs issued by a third-party identity provider against a
//! [`VerificationPolicy`], using public keys resolved through the
//! [`KeyStore`].
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - The header `alg` is checked against the allow-list before any key is
//!   resolved, so a forged header cannot trigger a JWKS fetch
//! - The key must support the header algorithm; a JWK that pins `alg` only
//!   verifies that algorithm
//! - Generic error messages prevent information leakage

use crate::auth::claims::ValidatedClaims;
use crate::auth::key_store::KeyStore;
use crate::auth::policy::VerificationPolicy;
use crate::errors::VerifyError;
use crate::observability::metrics::record_token_validation;
use common::jwt::{validate_exp, validate_nbf, RawToken, DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use jsonwebtoken::crypto;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// JWT verifier backed by a shared key store.
pub struct TokenVerifier {
    /// Key store for resolving public keys.
    key_store: Arc<KeyStore>,
    /// Default policy for [`TokenVerifier::verify`].
    policy: VerificationPolicy,
    /// Leeway applied to `exp` and `nbf`.
    clock_skew: Duration,
}

impl TokenVerifier {
    /// Create a verifier with no clock skew leeway.
    ///
    /// # Arguments
    ///
    /// * `key_store` - Store resolving signing keys for the policy's issuer
    /// * `policy` - What a valid token must look like
    pub fn new(key_store: Arc<KeyStore>, policy: VerificationPolicy) -> Self {
        Self {
            key_store,
            policy,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    /// Set the leeway for `exp` and `nbf`, capped at [`MAX_CLOCK_SKEW`].
    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew.min(MAX_CLOCK_SKEW);
        self
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    /// Verify a raw token against this verifier's policy.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`VerifyError`]; see
    /// [`TokenVerifier::verify_with_policy`].
    pub async fn verify(&self, raw_token: &str) -> Result<ValidatedClaims, VerifyError> {
        self.verify_with_policy(raw_token, &self.policy).await
    }

    /// Verify a raw token against an explicit policy.
    ///
    /// The policy must name the same JWKS endpoint the key store fetches
    /// from; otherwise the call fails with [`VerifyError::EndpointMismatch`]
    /// before the token is looked at. Build a separate verifier per
    /// endpoint.
    ///
    /// # Security Checks
    ///
    /// 0. Policy endpoint matches the key store
    /// 1. Structure - size limit, three base64url JSON segments, `kid` present
    /// 2. Header `alg` is in the policy allow-list
    /// 3. Signing key resolved by `kid` (may refresh the key set)
    /// 4. Signature over `header.payload`
    /// 5. `exp`, `nbf`, `iss`, `aud`
    ///
    /// # Errors
    ///
    /// Every variant of [`VerifyError`]; all share one generic message.
    #[instrument(skip_all)]
    pub async fn verify_with_policy(
        &self,
        raw_token: &str,
        policy: &VerificationPolicy,
    ) -> Result<ValidatedClaims, VerifyError> {
        let result = self.run_checks(raw_token, policy).await;

        match &result {
            Ok(_) => {
                tracing::debug!(target: "tg.auth.jwt", "Token validated successfully");
                record_token_validation("success", None);
            }
            Err(e) => {
                tracing::debug!(target: "tg.auth.jwt", error_type = e.kind(), "Token rejected");
                record_token_validation("error", Some(e.kind()));
            }
        }

        result
    }

    async fn run_checks(
        &self,
        raw_token: &str,
        policy: &VerificationPolicy,
    ) -> Result<ValidatedClaims, VerifyError> {
        // One key store serves one endpoint
        if let Some(endpoint) = self.key_store.jwks_endpoint() {
            if endpoint != policy.jwks_endpoint() {
                tracing::warn!(
                    target: "tg.auth.jwt",
                    store_endpoint = %endpoint,
                    policy_endpoint = %policy.jwks_endpoint(),
                    "Policy JWKS endpoint differs from key store endpoint"
                );
                return Err(VerifyError::EndpointMismatch);
            }
        }

        // 1. Structural parse (includes size check via common::jwt)
        let token = RawToken::parse(raw_token)?;

        // 2. Algorithm allow-list, before touching the key store
        let Some(algorithm) = policy.allowed_algorithm(token.algorithm()) else {
            tracing::debug!(
                target: "tg.auth.jwt",
                alg = %token.algorithm(),
                "Token algorithm not allowed"
            );
            return Err(VerifyError::AlgorithmNotAllowed);
        };

        let kid = token.kid()?;

        // 3. Resolve the signing key
        let key = self.key_store.get_key(kid).await?;

        // 4. Signature
        if !key.supports(algorithm) {
            tracing::warn!(
                target: "tg.auth.jwt",
                kid = %kid,
                token_alg = ?algorithm,
                key_alg = ?key.algorithm(),
                "Signing key does not support token algorithm"
            );
            return Err(VerifyError::InvalidSignature);
        }

        let verified = crypto::verify(
            token.signature(),
            token.signing_input().as_bytes(),
            key.decoding_key(),
            algorithm,
        )
        .map_err(|e| {
            tracing::debug!(target: "tg.auth.jwt", kid = %kid, error = %e, "Signature check errored");
            VerifyError::InvalidSignature
        })?;

        if !verified {
            tracing::debug!(target: "tg.auth.jwt", kid = %kid, "Signature mismatch");
            return Err(VerifyError::InvalidSignature);
        }

        // 5. Claims
        if let Some(exp) = token.time_claim("exp")? {
            validate_exp(exp, self.clock_skew)?;
        }
        if let Some(nbf) = token.time_claim("nbf")? {
            validate_nbf(nbf, self.clock_skew)?;
        }

        let claims = token.claims();
        if claims.get("iss").and_then(Value::as_str) != Some(policy.expected_issuer()) {
            tracing::debug!(target: "tg.auth.jwt", "Token issuer mismatch");
            return Err(VerifyError::IssuerMismatch);
        }

        if !audience_matches(claims.get("aud"), policy.expected_audience()) {
            tracing::debug!(target: "tg.auth.jwt", "Token audience mismatch");
            return Err(VerifyError::AudienceMismatch);
        }

        // 6. Typed claims
        Ok(ValidatedClaims::from_payload(token.into_claims()))
    }
}

/// `aud` may be a single string or an array of strings.
fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(audience)) => audience == expected,
        Some(Value::Array(audiences)) => audiences
            .iter()
            .any(|audience| audience.as_str() == Some(expected)),
        _ => false,
    }
}
