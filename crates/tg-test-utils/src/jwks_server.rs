//! Mock identity provider serving a JWKS document
//!
//! Wraps a `wiremock` server so tests can publish key sets, simulate
//! rotation and outages, and count how often keys were fetched.

use serde_json::Value;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path the mock serves keys on.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Test harness for a JWKS endpoint.
///
/// # Example
/// ```rust,ignore
/// let server = TestJwksServer::start().await;
/// let key = TestKeypair::rsa("abc");
/// server.serve_keys(&[&key]).await;
///
/// // ... verify tokens against server.jwks_url() ...
///
/// assert_eq!(server.fetch_count().await, 1);
/// ```
pub struct TestJwksServer {
    server: MockServer,
}

impl TestJwksServer {
    /// Start a server on a random local port with nothing mounted.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:41234`.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Full URL of the JWKS endpoint.
    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.server.uri(), JWKS_PATH)
    }

    /// Serve `jwks` until replaced.
    pub async fn serve_jwks(&self, jwks: Value) {
        self.mount(ResponseTemplate::new(200).set_body_json(jwks))
            .await;
    }

    /// Serve a key set made of the given keypairs' public JWKs.
    pub async fn serve_keys(&self, keys: &[&crate::TestKeypair]) {
        self.serve_jwks(crate::jwks_document(keys)).await;
    }

    /// Serve `jwks` after a delay, to hold a fetch in flight.
    pub async fn serve_jwks_delayed(&self, jwks: Value, delay: Duration) {
        self.mount(
            ResponseTemplate::new(200)
                .set_body_json(jwks)
                .set_delay(delay),
        )
        .await;
    }

    /// Answer every fetch with `status` and an empty body.
    pub async fn serve_status(&self, status: u16) {
        self.mount(ResponseTemplate::new(status)).await;
    }

    /// Answer every fetch with 200 and a raw body.
    pub async fn serve_raw(&self, body: &str) {
        self.mount(ResponseTemplate::new(200).set_body_string(body))
            .await;
    }

    /// Drop all mounted responses and the request log.
    ///
    /// Use before mounting a new key set to simulate rotation.
    pub async fn reset(&self) {
        self.server.reset().await;
    }

    /// Number of requests the endpoint has received.
    pub async fn fetch_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    async fn mount(&self, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }
}
