use std::io;
use thiserror::Error;

// Unified error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP/3 error: {0}")]
    Http3(String),

    #[error("QUIC handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Stream buffer overflow: {received} bytes exceeds limit of {limit} bytes")]
    BufferOverflow { received: usize, limit: usize },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Concurrent stream limit exceeded: {0}")]
    StreamLimitExceeded(u64),

    #[error("DoH frontend is already running")]
    AlreadyRunning,

    #[error("Invalid shutdown timeout")]
    InvalidShutdownTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<h3::error::Error> for AppError {
    fn from(err: h3::error::Error) -> Self {
        Self::Http3(err.to_string())
    }
}

// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadError(#[from] io::Error),

    #[error("YAML parsing error: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid server listen address: {0}")]
    InvalidListenAddress(String),

    #[error("Invalid backend address: {0}")]
    InvalidBackendAddress(String),

    #[error("Failed to read TLS material from {path}: {source}")]
    TlsFile { path: String, source: io::Error },

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
