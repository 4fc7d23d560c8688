//! Validated JWT claims.
//!
//! Produced only after signature, algorithm, expiry, issuer and audience
//! checks have passed. The `sub` field is redacted in Debug output to
//! prevent exposure in logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The `aud` claim: a single audience or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    /// Whether `audience` equals the single value or is one of the list.
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(value) => value == audience,
            Audience::Multiple(values) => values.iter().any(|v| v == audience),
        }
    }
}

/// Claims of a token that passed verification.
///
/// Registered claims are typed; everything else is kept verbatim in
/// `extra`, including a registered claim whose JSON type does not fit its
/// field (e.g. `"aud": ["my-api", 7]`). Serializing a `ValidatedClaims`
/// reproduces the token payload.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedClaims {
    /// Subject - redacted in Debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Expiration timestamp (Unix epoch seconds).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "numeric_date"
    )]
    pub exp: Option<i64>,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "numeric_date"
    )]
    pub iat: Option<i64>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "numeric_date"
    )]
    pub nbf: Option<i64>,

    /// Every claim not listed above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Custom Debug implementation that redacts the `sub` field.
impl fmt::Debug for ValidatedClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedClaims")
            .field("sub", &self.sub.as_ref().map(|_| "[REDACTED]"))
            .field("iss", &self.iss)
            .field("aud", &self.aud)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("nbf", &self.nbf)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValidatedClaims {
    /// Build from a decoded payload object. Never fails: registered claims
    /// that cannot be typed stay in `extra` and their field is `None`.
    pub(crate) fn from_payload(mut payload: Map<String, Value>) -> Self {
        let sub = take_typed(&mut payload, "sub", |v| v.as_str().map(str::to_owned));
        let iss = take_typed(&mut payload, "iss", |v| v.as_str().map(str::to_owned));
        let aud = take_typed(&mut payload, "aud", |v| Audience::deserialize(v).ok());
        let exp = take_typed(&mut payload, "exp", |v| v.as_number().and_then(number_to_date));
        let iat = take_typed(&mut payload, "iat", |v| v.as_number().and_then(number_to_date));
        let nbf = take_typed(&mut payload, "nbf", |v| v.as_number().and_then(number_to_date));

        Self {
            sub,
            iss,
            aud,
            exp,
            iat,
            nbf,
            extra: payload,
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    pub fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }

    pub fn audience(&self) -> Option<&Audience> {
        self.aud.as_ref()
    }

    /// Expiry as a timestamp, if the token carries one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|iat| DateTime::from_timestamp(iat, 0))
    }

    /// Look up a non-registered claim.
    pub fn get(&self, claim: &str) -> Option<&Value> {
        self.extra.get(claim)
    }

    /// Check if the token has a specific scope.
    ///
    /// Scopes are space-separated in the `scope` claim.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(&scope)
    }

    /// Get all scopes as a vector.
    pub fn scopes(&self) -> Vec<&str> {
        self.extra
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// Remove `claim` from the payload only if `convert` can type it.
fn take_typed<T>(
    payload: &mut Map<String, Value>,
    claim: &str,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Option<T> {
    let typed = payload.get(claim).and_then(convert)?;
    payload.remove(claim);
    Some(typed)
}

/// Accept integral or fractional NumericDate values; fractions are truncated.
#[allow(clippy::cast_possible_truncation)]
fn number_to_date(number: &serde_json::Number) -> Option<i64> {
    number.as_i64().or_else(|| number.as_f64().map(|f| f as i64))
}

fn numeric_date<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Number>::deserialize(deserializer)? {
        None => Ok(None),
        Some(number) => number_to_date(&number)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("NumericDate out of range")),
    }
}
