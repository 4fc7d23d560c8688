//! Token Guard Library
//!
//! Verifies bearer JWTs issued by a third-party identity provider, using
//! public keys published at the provider's JWKS endpoint:
//!
//! - Key set fetched over HTTPS with a bounded timeout
//! - Cached, refreshed when an unknown `kid` appears
//! - Refreshes coalesced and rate limited
//! - Signature, algorithm, expiry, issuer and audience checked against a policy
//!
//! # Modules
//!
//! - `auth` - Key fetching, caching and token verification
//! - `config` - Configuration from environment
//! - `errors` - Error types
//! - `observability` - Metrics

pub mod auth;
pub mod config;
pub mod errors;
pub mod observability;

pub use auth::{TokenVerifier, ValidatedClaims, VerificationPolicy};
pub use errors::VerifyError;
