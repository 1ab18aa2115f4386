//! Security modules for the gateway.
//!
//! Provides header-value sanitization for the response ABI and the
//! private-address detection backing the SSRF guard on JWKS fetches.

pub mod sanitize;
pub mod ssrf;

pub use sanitize::sanitize_header_value;
pub use ssrf::{host_is_blocked_literal, is_blocked_addr};
