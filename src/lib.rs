//! docguard - declarative access policies for document stores
//!
//! Policies are written in KDL, compiled once into an immutable
//! [`rules::RuleTable`], and evaluated per request by
//! [`rules::engine::decide`]. The binary serves decisions over HTTP.

pub mod errors;
pub mod rules;
pub mod settings;
pub mod web;
