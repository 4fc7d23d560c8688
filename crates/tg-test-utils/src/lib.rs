//! # Token Guard Test Utilities
//!
//! Shared test utilities for Token Guard.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (fixed RSA keys, seeded Ed25519 keys)
//! - Test data builders (TestTokenBuilder)
//! - A mock JWKS endpoint (TestJwksServer)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tg_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestJwksServer::start().await;
//!     let key = TestKeypair::rsa("abc");
//!     server.serve_keys(&[&key]).await;
//!
//!     let token = key.sign_token(&TestTokenBuilder::new().for_user("alice").build());
//! }
//! ```

pub mod crypto_fixtures;
pub mod jwks_server;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use jwks_server::*;
pub use token_builders::*;
