//! Error types for the mesh node.

use thiserror::Error;

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame decoded but violates the protocol (missing route, wrong handshake type, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection to [{0}] already exists")]
    DuplicateConnection(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Handler already registered for type: {0}")]
    DuplicateHandler(String),

    #[error("Type is reserved for the mesh: {0}")]
    ReservedType(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Node is shutting down")]
    Shutdown,
}
