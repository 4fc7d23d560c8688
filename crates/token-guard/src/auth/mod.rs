//! Bearer token authentication against a remote JWKS.
//!
//! # Components
//!
//! - `jwks` - JWKS fetching and parsing into signing keys
//! - `rate_limit` - Sliding-window budget for JWKS fetches
//! - `key_store` - Cached key set with single-flight refresh-on-miss
//! - `policy` - Issuer, audience and algorithm requirements
//! - `jwt` - Token verification pipeline
//! - `claims` - Claims of a verified token

pub mod claims;
pub mod jwks;
pub mod jwt;
pub mod key_store;
pub mod policy;
pub mod rate_limit;

pub use claims::{Audience, ValidatedClaims};
pub use jwks::{HttpJwksFetcher, KeySource, SigningKey};
pub use jwt::TokenVerifier;
pub use key_store::{KeyStore, KeyStoreConfig};
pub use policy::{PolicyError, VerificationPolicy};
pub use rate_limit::FetchRateLimiter;
