//! Error types for the broker.

use std::path::PathBuf;

/// Failures raised by the broker outside the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to spawn shell '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open pseudo-terminal: {0}")]
    Pty(String),
    #[error("I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read command catalog {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid command catalog {path}: {source}")]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a connection was refused before it could bind to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("missing sessionId")]
    MissingSession,
    #[error("unauthorized")]
    Unauthorized,
    #[error("session '{0}' is not allowed")]
    NotAllowed(String),
}
