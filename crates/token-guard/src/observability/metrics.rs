//! Metrics definitions for token verification.
//!
//! All metrics follow Prometheus naming conventions:
//! - `tg_` prefix for Token Guard
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! No recorder is installed by this crate; without one the macros are no-ops.
//! The embedding service decides how (and whether) to export.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `status`: fetch outcome (3 values) or validation outcome (2 values)
//! - `result`: cache lookup outcome (hit, miss)
//! - `error_type`: one per `VerifyError` kind (10 values)

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// JWKS Metrics
// ============================================================================

/// Record one JWKS fetch round-trip.
///
/// Metric: `tg_jwks_fetch_total`, `tg_jwks_fetch_duration_seconds`
/// Labels: `status` (success, network_error, malformed_response)
pub fn record_jwks_fetch(status: &str, duration: Duration) {
    histogram!("tg_jwks_fetch_duration_seconds", "status" => status.to_string())
        .record(duration.as_secs_f64());

    counter!("tg_jwks_fetch_total", "status" => status.to_string()).increment(1);
}

/// Record a key lookup against the cached key set.
///
/// Metric: `tg_jwks_cache_total`
/// Labels: `result` (hit, miss)
pub fn record_jwks_cache(result: &str) {
    counter!("tg_jwks_cache_total", "result" => result.to_string()).increment(1);
}

/// Record a refresh refused by the fetch rate limiter.
///
/// Metric: `tg_jwks_rate_limited_total`
pub fn record_jwks_rate_limited() {
    counter!("tg_jwks_rate_limited_total").increment(1);
}

// ============================================================================
// Validation Metrics
// ============================================================================

/// Record token validation result.
///
/// Metric: `tg_token_validations_total`
/// Labels: `status` (success, error), `error_type`
pub fn record_token_validation(status: &str, error_type: Option<&str>) {
    let error_type = error_type.unwrap_or("none");
    counter!("tg_token_validations_total", "status" => status.to_string(), "error_type" => error_type.to_string())
        .increment(1);
}
