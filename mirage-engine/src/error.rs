//! Error types for the mirage engine

use mirage_tun::TunSpec;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single tunnel candidate
#[derive(Debug, Error)]
#[error("{spec}: {error}")]
pub struct CandidateError {
    pub spec: TunSpec,
    pub error: Error,
}

fn join_candidates(errors: &[CandidateError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the engine, backend and control socket
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Packet codec error
    #[error("packet error: {0}")]
    Packet(#[from] mirage_packet::Error),

    /// Tunnel, router or DNS primitive error
    #[error("TUN error: {0}")]
    Tun(#[from] mirage_tun::Error),

    /// Every tunnel candidate failed; one entry per candidate, in order
    #[error("all tunnel candidates failed: {}", join_candidates(.0))]
    Assembly(Vec<CandidateError>),

    /// Transport engine error
    #[error("engine error: {0}")]
    Engine(String),

    /// State store error
    #[error("state store error: {0}")]
    Store(String),

    /// Operation not supported on this build
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Control socket request arrived before the backend was installed
    #[error("backend is starting")]
    BackendStarting,

    /// Control socket protocol error
    #[error("control error: {0}")]
    Control(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Work was abandoned because shutdown was requested
    #[error("cancelled")]
    Cancelled,

    /// The parent process went away
    #[error("parent process died")]
    ParentDied,
}

impl Error {
    /// Cancellation is an orderly exit, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }

    /// Per-candidate failures of an assembly error
    pub fn candidates(&self) -> &[CandidateError] {
        match self {
            Error::Assembly(errors) => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembly_error_lists_candidates_in_order() {
        let err = Error::Assembly(vec![
            CandidateError {
                spec: TunSpec::Kernel("mirage0".into()),
                error: Error::Engine("port in use".into()),
            },
            CandidateError {
                spec: TunSpec::Userspace,
                error: Error::Engine("boom".into()),
            },
        ]);

        assert_eq!(err.candidates().len(), 2);
        assert_eq!(
            err.to_string(),
            "all tunnel candidates failed: mirage0: engine error: port in use; \
             userspace-networking: engine error: boom"
        );
    }

    #[test]
    fn test_cancelled_is_not_config() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_config_error());
        assert!(Error::BackendStarting.to_string().contains("starting"));
    }
}
