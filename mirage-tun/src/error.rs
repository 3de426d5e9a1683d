//! Error types for mirage-tun

use std::io;
use thiserror::Error;

/// Result type alias for mirage-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening or configuring OS primitives
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid tunnel specification
    #[error("invalid tunnel spec: {0}")]
    InvalidSpec(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Device not found
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device or configurator was already closed
    #[error("{0} is closed")]
    Closed(String),

    /// Route or address configuration error
    #[error("route error: {0}")]
    Route(String),

    /// Resolver configuration error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Network namespace switch error
    #[error("namespace error: {0}")]
    Namespace(String),
}
