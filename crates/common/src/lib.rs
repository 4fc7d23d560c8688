//! Common utilities and types shared across Token Guard components.

#![warn(clippy::pedantic)]

/// Module for JWT utilities (structural parsing, size limits, time claims)
pub mod jwt;
