//! Common types for meshbed: errors, retry/poll primitives, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix applied to every generated container, network, and volume name
pub const CONTAINER_PREFIX: &str = "meshbed";
