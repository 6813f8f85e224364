// kvx-common - Shared configuration and error types for the KVX access layer
//
// This crate defines the connection profile consumed by the pooled client

pub mod error;
pub mod profile;

// Re-export for convenience
pub use error::*;
pub use profile::*;
