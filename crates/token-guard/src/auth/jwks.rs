//! JWKS fetching: one round-trip to the identity provider's key endpoint.
//!
//! The fetcher downloads `/.well-known/jwks.json` and turns each usable JWK
//! into a [`SigningKey`]. It does not cache and does not retry; both are the
//! key store's job, bounded by the fetch rate limiter.
//!
//! # Security
//!
//! - Outbound requests carry a hard timeout; a hung provider is a network error
//! - Response bodies are capped before JSON parsing
//! - Keys for encryption (`use` other than `sig`) and symmetric keys are skipped
//! - HTTPS should be used in production (enforced by deployment config)

use crate::errors::FetchError;
use crate::observability::metrics::record_jwks_fetch;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Default outbound request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest JWKS body accepted (64KB).
pub const MAX_JWKS_BODY_BYTES: usize = 64 * 1024;

/// JSON Web Key from JWKS endpoint.
///
/// Only the members needed for signature verification are read.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC" or "OKP").
    pub kty: String,

    /// Key ID - used to select the correct key for verification.
    #[serde(default)]
    pub kid: Option<String>,

    /// Algorithm the key is intended for (e.g. "RS256").
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (should be "sig" for signing).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    /// Curve name for EC and OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    /// EC x coordinate, or the OKP public key (base64url).
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default)]
    pub y: Option<String>,
}

/// JWKS response body.
///
/// Keys are kept as raw JSON so that one malformed entry does not reject
/// the whole set.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    pub keys: Vec<serde_json::Value>,
}

/// A public key ready for signature verification.
///
/// Immutable once built; identified by `key_id` within one key set.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    algorithm: Algorithm,
    /// Whether `algorithm` came from the JWK's own `alg` member rather than
    /// being inferred from the key type.
    algorithm_declared: bool,
    decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("algorithm_declared", &self.algorithm_declared)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Build a signing key from a JWK.
    ///
    /// # Errors
    ///
    /// Returns a short reason when the JWK is not a usable signature key.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        if let Some(key_use) = jwk.key_use.as_deref() {
            if key_use != "sig" {
                return Err(format!("key use '{key_use}' is not 'sig'"));
            }
        }

        let key_id = jwk
            .kid
            .clone()
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| "missing kid".to_string())?;

        let declared = jwk
            .alg
            .as_deref()
            .map(|alg| Algorithm::from_str(alg).map_err(|_| format!("unknown alg '{alg}'")))
            .transpose()?;

        let (inferred, decoding_key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = required(&jwk.n, "n")?;
                let e = required(&jwk.e, "e")?;
                let key = DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| format!("invalid RSA components: {e}"))?;
                (Algorithm::RS256, key)
            }
            "EC" => {
                let inferred = match jwk.crv.as_deref() {
                    Some("P-256") => Algorithm::ES256,
                    Some("P-384") => Algorithm::ES384,
                    other => return Err(format!("unsupported EC curve {other:?}")),
                };
                let x = required(&jwk.x, "x")?;
                let y = required(&jwk.y, "y")?;
                let key = DecodingKey::from_ec_components(x, y)
                    .map_err(|e| format!("invalid EC components: {e}"))?;
                (inferred, key)
            }
            "OKP" => {
                if jwk.crv.as_deref() != Some("Ed25519") {
                    return Err(format!("unsupported OKP curve {:?}", jwk.crv));
                }
                let x = required(&jwk.x, "x")?;
                let key = DecodingKey::from_ed_components(x)
                    .map_err(|e| format!("invalid OKP public key: {e}"))?;
                (Algorithm::EdDSA, key)
            }
            other => return Err(format!("unsupported key type '{other}'")),
        };

        let algorithm = declared.unwrap_or(inferred);
        let consistent = match key_family(inferred) {
            KeyFamily::Rsa => key_family(algorithm) == KeyFamily::Rsa,
            _ => algorithm == inferred,
        };
        if !consistent {
            return Err(format!(
                "alg {algorithm:?} does not match key type '{}'",
                jwk.kty
            ));
        }

        Ok(Self {
            key_id,
            algorithm,
            algorithm_declared: declared.is_some(),
            decoding_key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Algorithm declared by the JWK, or inferred from its key type.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether this key may verify a signature made with `algorithm`.
    ///
    /// A JWK that pins `alg` accepts only that algorithm; otherwise any
    /// algorithm of the same key family is accepted (RS* and PS* for RSA).
    pub fn supports(&self, algorithm: Algorithm) -> bool {
        match (self.algorithm_declared, key_family(self.algorithm)) {
            (false, KeyFamily::Rsa) => key_family(algorithm) == KeyFamily::Rsa,
            // EC and OKP keys are bound to one algorithm by their curve
            _ => self.algorithm == algorithm,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum KeyFamily {
    Rsa,
    Ec,
    Okp,
    Symmetric,
}

fn key_family(algorithm: Algorithm) -> KeyFamily {
    match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => KeyFamily::Rsa,
        Algorithm::ES256 | Algorithm::ES384 => KeyFamily::Ec,
        Algorithm::EdDSA => KeyFamily::Okp,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => KeyFamily::Symmetric,
    }
}

fn required<'a>(member: &'a Option<String>, name: &str) -> Result<&'a str, String> {
    member
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing '{name}'"))
}

/// Parse a JWKS document into signing keys.
///
/// Unusable entries are skipped with a warning.
///
/// # Errors
///
/// Returns `FetchError::MalformedResponse` if the body is not a JWKS
/// document or no entry survives.
pub fn parse_jwks(body: &[u8]) -> Result<Vec<SigningKey>, FetchError> {
    let jwks: JwksResponse = serde_json::from_slice(body).map_err(|e| {
        tracing::error!(target: "tg.auth.jwks", error = %e, "Failed to parse JWKS response");
        FetchError::MalformedResponse("body is not a JWKS document".to_string())
    })?;

    let total = jwks.keys.len();
    let keys: Vec<SigningKey> = jwks
        .keys
        .into_iter()
        .filter_map(|entry| {
            let jwk: Jwk = match serde_json::from_value(entry) {
                Ok(jwk) => jwk,
                Err(e) => {
                    tracing::warn!(target: "tg.auth.jwks", error = %e, "Skipping malformed JWK");
                    return None;
                }
            };
            match SigningKey::from_jwk(&jwk) {
                Ok(key) => Some(key),
                Err(reason) => {
                    tracing::warn!(
                        target: "tg.auth.jwks",
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        reason = %reason,
                        "Skipping unusable JWK"
                    );
                    None
                }
            }
        })
        .collect();

    if keys.is_empty() {
        tracing::error!(target: "tg.auth.jwks", total, "JWKS contains no usable signing keys");
        return Err(FetchError::MalformedResponse(format!(
            "none of {total} keys are usable"
        )));
    }

    Ok(keys)
}

/// Source of signing keys.
///
/// The production implementation is [`HttpJwksFetcher`]; tests substitute
/// in-memory sources.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the complete current key set.
    async fn fetch(&self) -> Result<Vec<SigningKey>, FetchError>;

    /// Where keys come from, for logs.
    fn describe(&self) -> String;

    /// JWKS URL this source fetches, if it is URL-backed.
    fn endpoint(&self) -> Option<&Url> {
        None
    }
}

/// Fetches the key set over HTTP(S).
pub struct HttpJwksFetcher {
    /// URL to the JWKS endpoint.
    jwks_url: Url,

    /// HTTP client for fetching JWKS.
    http_client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Create a fetcher with the default 10 second timeout.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Network` if the HTTP client cannot be built.
    pub fn new(jwks_url: Url) -> Result<Self, FetchError> {
        Self::with_timeout(jwks_url, DEFAULT_FETCH_TIMEOUT)
    }

    /// Create a fetcher with a custom request timeout.
    ///
    /// # Arguments
    ///
    /// * `jwks_url` - URL to the identity provider's JWKS endpoint
    /// * `timeout` - Upper bound for connect + request + body
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Network` if the HTTP client cannot be built.
    pub fn with_timeout(jwks_url: Url, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                tracing::error!(target: "tg.auth.jwks", error = %e, "Failed to build HTTP client");
                FetchError::Network("failed to build HTTP client".to_string())
            })?;

        Ok(Self {
            jwks_url,
            http_client,
        })
    }

    pub fn jwks_url(&self) -> &Url {
        &self.jwks_url
    }

    async fn fetch_body(&self) -> Result<Vec<u8>, FetchError> {
        let mut response = self
            .http_client
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    target: "tg.auth.jwks",
                    error = %e,
                    timeout = e.is_timeout(),
                    "Failed to fetch JWKS"
                );
                network_error(&e)
            })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "tg.auth.jwks",
                status = %response.status(),
                "JWKS endpoint returned error"
            );
            return Err(FetchError::Network(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        if let Some(length) = response.content_length() {
            if length > MAX_JWKS_BODY_BYTES as u64 {
                return Err(oversized_body(length));
            }
        }

        // Content-Length is absent for chunked bodies, so the cap is also
        // enforced while reading
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            tracing::error!(target: "tg.auth.jwks", error = %e, "Failed to read JWKS body");
            network_error(&e)
        })? {
            if body.len() + chunk.len() > MAX_JWKS_BODY_BYTES {
                return Err(oversized_body((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

fn oversized_body(length: u64) -> FetchError {
    tracing::error!(
        target: "tg.auth.jwks",
        length,
        limit = MAX_JWKS_BODY_BYTES,
        "JWKS body exceeds size limit"
    );
    FetchError::MalformedResponse(format!("body of at least {length} bytes exceeds limit"))
}

fn network_error(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Network("request timed out".to_string())
    } else {
        FetchError::Network("request failed".to_string())
    }
}

#[async_trait]
impl KeySource for HttpJwksFetcher {
    #[instrument(skip(self), fields(url = %self.jwks_url))]
    async fn fetch(&self) -> Result<Vec<SigningKey>, FetchError> {
        tracing::debug!(target: "tg.auth.jwks", "Fetching JWKS");
        let start = Instant::now();

        let result = match self.fetch_body().await {
            Ok(body) => parse_jwks(&body),
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(FetchError::Network(_)) => "network_error",
            Err(FetchError::MalformedResponse(_)) => "malformed_response",
        };
        record_jwks_fetch(status, start.elapsed());

        if let Ok(keys) = &result {
            tracing::info!(target: "tg.auth.jwks", key_count = keys.len(), "JWKS fetched");
        }

        result
    }

    fn describe(&self) -> String {
        self.jwks_url.to_string()
    }

    fn endpoint(&self) -> Option<&Url> {
        Some(&self.jwks_url)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // RFC 7517 appendix A.1 example RSA key.
    const RSA_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    /// Serve one HTTP/1.1 response with a chunked body and no
    /// Content-Length, split into `chunk_size` pieces.
    async fn serve_chunked_once(body: Vec<u8>, chunk_size: usize) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;

            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for piece in body.chunks(chunk_size) {
                let mut frame = format!("{:x}\r\n", piece.len()).into_bytes();
                frame.extend_from_slice(piece);
                frame.extend_from_slice(b"\r\n");
                // Client hangs up once the cap is hit
                if socket.write_all(&frame).await.is_err() {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });

        Url::parse(&format!("http://{addr}/.well-known/jwks.json")).unwrap()
    }

    fn rsa_jwk(kid: &str) -> serde_json::Value {
        json!({ "kty": "RSA", "kid": kid, "use": "sig", "alg": "RS256", "n": RSA_N, "e": "AQAB" })
    }

    #[test]
    fn test_jwk_deserialization() {
        let jwk: Jwk = serde_json::from_value(rsa_jwk("abc")).unwrap();

        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some("abc"));
        assert_eq!(jwk.alg.as_deref(), Some("RS256"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert!(jwk.crv.is_none());
    }

    #[test]
    fn test_signing_key_from_rsa_jwk() {
        let jwk: Jwk = serde_json::from_value(rsa_jwk("abc")).unwrap();
        let key = SigningKey::from_jwk(&jwk).unwrap();

        assert_eq!(key.key_id(), "abc");
        assert_eq!(key.algorithm(), Algorithm::RS256);
        assert!(key.supports(Algorithm::RS256));
        assert!(!key.supports(Algorithm::RS384), "pinned alg must be exact");
    }

    #[test]
    fn test_signing_key_infers_algorithm_when_absent() {
        let jwk: Jwk =
            serde_json::from_value(json!({ "kty": "RSA", "kid": "k", "n": RSA_N, "e": "AQAB" }))
                .unwrap();
        let key = SigningKey::from_jwk(&jwk).unwrap();

        assert_eq!(key.algorithm(), Algorithm::RS256);
        assert!(key.supports(Algorithm::RS512));
        assert!(key.supports(Algorithm::PS256));
        assert!(!key.supports(Algorithm::ES256));
        assert!(!key.supports(Algorithm::HS256));
    }

    #[test]
    fn test_signing_key_rejects_unusable_jwks() {
        let cases = [
            json!({ "kty": "RSA", "kid": "enc", "use": "enc", "n": RSA_N, "e": "AQAB" }),
            json!({ "kty": "RSA", "n": RSA_N, "e": "AQAB" }),
            json!({ "kty": "RSA", "kid": "no-e", "n": RSA_N }),
            json!({ "kty": "RSA", "kid": "bad-alg", "alg": "ES256", "n": RSA_N, "e": "AQAB" }),
            json!({ "kty": "RSA", "kid": "hs", "alg": "HS256", "n": RSA_N, "e": "AQAB" }),
            json!({ "kty": "oct", "kid": "sym", "k": "c2VjcmV0" }),
            json!({ "kty": "EC", "kid": "curve", "crv": "P-521", "x": "AA", "y": "AA" }),
            json!({ "kty": "OKP", "kid": "x448", "crv": "X448", "x": "AA" }),
        ];

        for case in cases {
            let jwk: Jwk = serde_json::from_value(case.clone()).unwrap();
            assert!(SigningKey::from_jwk(&jwk).is_err(), "{case} should be rejected");
        }
    }

    #[test]
    fn test_parse_jwks_skips_bad_entries() {
        let body = json!({
            "keys": [
                rsa_jwk("good"),
                { "kty": "oct", "kid": "sym", "k": "c2VjcmV0" },
                { "no_kty": true },
                "not-an-object",
            ]
        });

        let keys = parse_jwks(body.to_string().as_bytes()).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id(), "good");
    }

    #[test]
    fn test_parse_jwks_rejects_empty_or_unusable_set() {
        assert!(matches!(
            parse_jwks(br#"{"keys":[]}"#),
            Err(FetchError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_jwks(br#"{"keys":[{"kty":"oct","kid":"a","k":"AA"}]}"#),
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_jwks_rejects_non_jwks_body() {
        for body in [&b"<html>oops</html>"[..], br#"{"key":[]}"#, b""] {
            assert!(matches!(
                parse_jwks(body),
                Err(FetchError::MalformedResponse(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_http_fetcher_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "keys": [rsa_jwk("abc")] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let fetcher = HttpJwksFetcher::new(url).unwrap();

        let keys = fetcher.fetch().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id(), "abc");
    }

    #[tokio::test]
    async fn test_http_fetcher_error_status_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let fetcher = HttpJwksFetcher::new(url).unwrap();

        assert!(matches!(
            fetcher.fetch().await,
            Err(FetchError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_http_fetcher_timeout_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "keys": [rsa_jwk("abc")] }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let fetcher = HttpJwksFetcher::with_timeout(url, Duration::from_millis(100)).unwrap();

        assert_eq!(
            fetcher.fetch().await.unwrap_err(),
            FetchError::Network("request timed out".to_string())
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_oversized_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(MAX_JWKS_BODY_BYTES + 1)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let fetcher = HttpJwksFetcher::new(url).unwrap();

        assert!(matches!(
            fetcher.fetch().await,
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_http_fetcher_chunked_body_is_read() {
        let body = serde_json::to_vec(&json!({ "keys": [rsa_jwk("abc")] })).unwrap();
        let url = serve_chunked_once(body, 100).await;
        let fetcher = HttpJwksFetcher::with_timeout(url, Duration::from_secs(5)).unwrap();

        let keys = fetcher.fetch().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id(), "abc");
    }

    #[tokio::test]
    async fn test_http_fetcher_oversized_chunked_body_is_malformed() {
        // No Content-Length: the cap must hold while streaming
        let body = vec![b' '; MAX_JWKS_BODY_BYTES * 4];
        let url = serve_chunked_once(body, 8 * 1024).await;
        let fetcher = HttpJwksFetcher::with_timeout(url, Duration::from_secs(5)).unwrap();

        let result = fetcher.fetch().await;
        assert!(
            matches!(&result, Err(FetchError::MalformedResponse(msg)) if msg.contains("exceeds limit")),
            "expected MalformedResponse, got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_network_error() {
        // Port 9 (discard) on localhost is not expected to be listening
        let url = Url::parse("http://127.0.0.1:9/.well-known/jwks.json").unwrap();
        let fetcher = HttpJwksFetcher::with_timeout(url, Duration::from_secs(2)).unwrap();

        assert!(matches!(
            fetcher.fetch().await,
            Err(FetchError::Network(_))
        ));
    }
}
