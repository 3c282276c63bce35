//! Zero-trust policy plane.
//!
//! A [`PolicyDocument`] is loaded fresh on every invocation and enforced
//! by four gates before any side-effecting command runs: command
//! allow-list, path globs, environment passthrough, and signed-context
//! requirements. [`tokens`] holds the short-lived trust tokens that allow
//! narrowly scoped one-shot overrides.

pub mod document;
pub mod gates;
pub mod tokens;

pub use document::{doctor, Finding, FindingLevel, PolicyDocument};
pub use tokens::{TrustToken, TrustTokenStore};
