//! Observability for token verification.
//!
//! # Privacy by Default
//!
//! Instrumentation never records token contents, signatures, or subjects.
//! Fields are limited to:
//! - **SAFE**: key ids, algorithm names, outcome labels, durations
//! - **NEVER**: raw tokens, claims values, key material

pub mod metrics;
