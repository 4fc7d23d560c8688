//! Token Guard configuration.
//!
//! Configuration is loaded from environment variables and validated once;
//! a `Config` that exists is usable.

use crate::auth::jwks::{HttpJwksFetcher, DEFAULT_FETCH_TIMEOUT};
use crate::auth::jwt::TokenVerifier;
use crate::auth::key_store::{KeyStore, KeyStoreConfig};
use crate::auth::policy::{PolicyError, VerificationPolicy};
use crate::auth::rate_limit::{
    FetchRateLimiter, DEFAULT_FETCHES_PER_MINUTE, MAX_FETCHES_PER_MINUTE,
};
use crate::errors::FetchError;
use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use jsonwebtoken::Algorithm;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted JWKS fetch timeout in seconds.
pub const MAX_FETCH_TIMEOUT_SECONDS: u64 = 60;

/// Token Guard configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Issuer, audience, algorithms and JWKS endpoint.
    pub policy: VerificationPolicy,

    /// JWKS fetches allowed per minute (default: 5).
    pub jwks_requests_per_minute: u32,

    /// Key set TTL in seconds; `None` keeps keys until an unknown `kid` appears.
    pub jwks_cache_ttl_seconds: Option<u64>,

    /// Outbound JWKS request timeout in seconds (default: 10).
    pub jwks_fetch_timeout_seconds: u64,

    /// Serve keys from an expired key set when its refresh fails.
    pub jwks_serve_stale_on_error: bool,

    /// Leeway for `exp` and `nbf` in seconds (default: 0).
    pub jwt_clock_skew_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid verification policy: {0}")]
    InvalidPolicy(#[from] PolicyError),

    #[error("Invalid algorithm configuration: {0}")]
    InvalidAlgorithms(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid JWKS cache TTL configuration: {0}")]
    InvalidCacheTtl(String),

    #[error("Invalid JWKS fetch timeout configuration: {0}")]
    InvalidFetchTimeout(String),

    #[error("Invalid serve-stale configuration: {0}")]
    InvalidServeStale(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Failed to initialize JWKS fetcher: {0}")]
    Fetcher(#[from] FetchError),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let issuer = vars
            .get("AUTH_ISSUER")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_ISSUER".to_string()))?;

        let audience = vars
            .get("AUTH_AUDIENCE")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_AUDIENCE".to_string()))?;

        let mut policy = VerificationPolicy::new(issuer.as_str(), audience.as_str())?;

        if let Some(url) = vars.get("JWKS_URL") {
            policy = policy.with_jwks_endpoint(url)?;
        }

        if let Some(value_str) = vars.get("JWT_ALLOWED_ALGORITHMS") {
            let algorithms = parse_algorithms(value_str)?;
            policy = policy.with_algorithms(algorithms)?;
        }

        // Parse JWKS fetch budget with validation
        let jwks_requests_per_minute =
            if let Some(value_str) = vars.get("JWKS_REQUESTS_PER_MINUTE") {
                let value: u32 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidRateLimit(format!(
                        "JWKS_REQUESTS_PER_MINUTE must be a valid positive integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidRateLimit(
                        "JWKS_REQUESTS_PER_MINUTE must be greater than 0".to_string(),
                    ));
                }

                if value > MAX_FETCHES_PER_MINUTE {
                    return Err(ConfigError::InvalidRateLimit(format!(
                        "JWKS_REQUESTS_PER_MINUTE must not exceed {}, got {}",
                        MAX_FETCHES_PER_MINUTE, value
                    )));
                }

                value
            } else {
                DEFAULT_FETCHES_PER_MINUTE
            };

        let jwks_cache_ttl_seconds = match vars.get("JWKS_CACHE_TTL_SECONDS") {
            Some(value_str) => {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidCacheTtl(format!(
                        "JWKS_CACHE_TTL_SECONDS must be a valid positive integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidCacheTtl(
                        "JWKS_CACHE_TTL_SECONDS must be greater than 0".to_string(),
                    ));
                }

                Some(value)
            }
            None => None,
        };

        let jwks_fetch_timeout_seconds =
            if let Some(value_str) = vars.get("JWKS_FETCH_TIMEOUT_SECONDS") {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidFetchTimeout(format!(
                        "JWKS_FETCH_TIMEOUT_SECONDS must be a valid positive integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                if value == 0 || value > MAX_FETCH_TIMEOUT_SECONDS {
                    return Err(ConfigError::InvalidFetchTimeout(format!(
                        "JWKS_FETCH_TIMEOUT_SECONDS must be between 1 and {}, got {}",
                        MAX_FETCH_TIMEOUT_SECONDS, value
                    )));
                }

                value
            } else {
                DEFAULT_FETCH_TIMEOUT.as_secs()
            };

        let jwks_serve_stale_on_error = match vars.get("JWKS_SERVE_STALE_ON_ERROR") {
            Some(value_str) => parse_bool(value_str).ok_or_else(|| {
                ConfigError::InvalidServeStale(format!(
                    "JWKS_SERVE_STALE_ON_ERROR must be true or false, got '{}'",
                    value_str
                ))
            })?,
            None => false,
        };

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew_seconds = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            let value = u64::try_from(value).map_err(|_| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not be negative, got {}",
                    value
                ))
            })?;

            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW.as_secs()
        };

        Ok(Config {
            policy,
            jwks_requests_per_minute,
            jwks_cache_ttl_seconds,
            jwks_fetch_timeout_seconds,
            jwks_serve_stale_on_error,
            jwt_clock_skew_seconds,
        })
    }

    pub fn key_store_config(&self) -> KeyStoreConfig {
        KeyStoreConfig {
            cache_ttl: self.jwks_cache_ttl_seconds.map(Duration::from_secs),
            serve_stale_on_error: self.jwks_serve_stale_on_error,
        }
    }

    /// Wire an HTTP fetcher, rate limiter and key store into a verifier.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Fetcher` if the HTTP client cannot be built.
    pub fn build_verifier(&self) -> Result<TokenVerifier, ConfigError> {
        let fetcher = HttpJwksFetcher::with_timeout(
            self.policy.jwks_endpoint().clone(),
            Duration::from_secs(self.jwks_fetch_timeout_seconds),
        )?;

        let key_store = KeyStore::new(
            Arc::new(fetcher),
            FetchRateLimiter::per_minute(self.jwks_requests_per_minute),
            self.key_store_config(),
        );

        Ok(
            TokenVerifier::new(Arc::new(key_store), self.policy.clone())
                .with_clock_skew(Duration::from_secs(self.jwt_clock_skew_seconds)),
        )
    }
}

/// Comma-separated algorithm names, e.g. "RS256, ES256".
fn parse_algorithms(value: &str) -> Result<Vec<Algorithm>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Algorithm::from_str(name).map_err(|_| {
                ConfigError::InvalidAlgorithms(format!(
                    "JWT_ALLOWED_ALGORITHMS contains unknown algorithm '{}'",
                    name
                ))
            })
        })
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
