//! # Cropsight
//!
//! Image-based crop-health inference service with a record-keeping layer
//! (fields, spots, analysis results) and geometric field metrics.
//!
//! The heart of the crate is the adaptive checkpoint loader: artifacts of
//! unknown internal shape are normalized into a flat parameter map, their
//! output-class count and structural variant are inferred purely from
//! parameter shapes and naming conventions, a matching architecture is
//! built from the registry, and weights are bound under a strict-then-
//! partial protocol that reports mismatches instead of failing on them.

pub mod api;
pub mod arch;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod geometry;
pub mod inference;
pub mod loader;
pub mod quality;
pub mod utils;
pub mod zoo;

// Re-exports
pub use error::{Result, ServiceError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
