//! Verification policy.
//!
//! The policy names who must have issued a token, who it must be for, which
//! signing algorithms are acceptable, and where the issuer publishes its
//! keys. It is validated once at construction and immutable afterwards.

use jsonwebtoken::Algorithm;
use reqwest::Url;
use std::str::FromStr;
use thiserror::Error;

/// Path of the key set relative to the issuer, per OpenID discovery.
pub const WELL_KNOWN_JWKS_PATH: &str = ".well-known/jwks.json";

/// Algorithms accepted when none are configured.
pub const DEFAULT_ALLOWED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Expected audience must not be empty")]
    EmptyAudience,

    #[error("Expected issuer must not be empty")]
    EmptyIssuer,

    #[error("At least one algorithm must be allowed")]
    NoAlgorithms,

    #[error("Algorithm not supported for JWKS verification: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid JWKS endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Immutable description of what a valid token looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationPolicy {
    expected_audience: String,
    expected_issuer: String,
    allowed_algorithms: Vec<Algorithm>,
    jwks_endpoint: Url,
}

impl VerificationPolicy {
    /// Create a policy for an issuer, deriving the JWKS endpoint as
    /// `<issuer>/.well-known/jwks.json` and allowing only RS256.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` if the issuer or audience is empty, or the
    /// derived endpoint is not an http(s) URL.
    pub fn new(
        expected_issuer: impl Into<String>,
        expected_audience: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let expected_issuer = expected_issuer.into();
        let expected_audience = expected_audience.into();

        if expected_issuer.trim().is_empty() {
            return Err(PolicyError::EmptyIssuer);
        }
        if expected_audience.trim().is_empty() {
            return Err(PolicyError::EmptyAudience);
        }

        let jwks_endpoint = parse_endpoint(&jwks_url_for_issuer(&expected_issuer))?;

        Ok(Self {
            expected_audience,
            expected_issuer,
            allowed_algorithms: DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
            jwks_endpoint,
        })
    }

    /// Replace the algorithm allow-list.
    ///
    /// Duplicates are collapsed. Symmetric (HS*) algorithms are refused: a
    /// published key set never carries shared secrets, and allowing them is
    /// the classic algorithm-substitution hole.
    ///
    /// # Errors
    ///
    /// Returns `NoAlgorithms` for an empty list, `UnsupportedAlgorithm` for
    /// HS256/HS384/HS512.
    pub fn with_algorithms(
        mut self,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Result<Self, PolicyError> {
        let mut allowed = Vec::new();
        for algorithm in algorithms {
            if matches!(
                algorithm,
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
            ) {
                return Err(PolicyError::UnsupportedAlgorithm(format!("{algorithm:?}")));
            }
            if !allowed.contains(&algorithm) {
                allowed.push(algorithm);
            }
        }

        if allowed.is_empty() {
            return Err(PolicyError::NoAlgorithms);
        }

        self.allowed_algorithms = allowed;
        Ok(self)
    }

    /// Override the derived JWKS endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` unless `endpoint` is an absolute http(s) URL.
    pub fn with_jwks_endpoint(mut self, endpoint: &str) -> Result<Self, PolicyError> {
        self.jwks_endpoint = parse_endpoint(endpoint)?;
        Ok(self)
    }

    pub fn expected_audience(&self) -> &str {
        &self.expected_audience
    }

    pub fn expected_issuer(&self) -> &str {
        &self.expected_issuer
    }

    pub fn allowed_algorithms(&self) -> &[Algorithm] {
        &self.allowed_algorithms
    }

    pub fn jwks_endpoint(&self) -> &Url {
        &self.jwks_endpoint
    }

    /// Resolve a header `alg` value against the allow-list.
    ///
    /// Unknown names (including `none`) are never allowed.
    pub fn allowed_algorithm(&self, alg: &str) -> Option<Algorithm> {
        Algorithm::from_str(alg)
            .ok()
            .filter(|algorithm| self.allowed_algorithms.contains(algorithm))
    }
}

/// `<issuer>/.well-known/jwks.json`, tolerating a trailing slash on the issuer.
pub fn jwks_url_for_issuer(issuer: &str) -> String {
    if issuer.ends_with('/') {
        format!("{issuer}{WELL_KNOWN_JWKS_PATH}")
    } else {
        format!("{issuer}/{WELL_KNOWN_JWKS_PATH}")
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, PolicyError> {
    let url = Url::parse(endpoint)
        .map_err(|e| PolicyError::InvalidEndpoint(format!("'{endpoint}': {e}")))?;

    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(PolicyError::InvalidEndpoint(format!(
            "'{endpoint}': unsupported scheme '{other}'"
        ))),
    }
}
