//! Error types for packet encoding

use thiserror::Error;

/// Result type alias for packet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while marshaling packets
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer too small: need at least {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("packet too large: {actual} bytes exceeds maximum of {max}")]
    PacketTooLarge { actual: usize, max: usize },

    #[error("mixed address families: {src} and {dst}")]
    AddressFamilyMismatch {
        src: std::net::IpAddr,
        dst: std::net::IpAddr,
    },
}
