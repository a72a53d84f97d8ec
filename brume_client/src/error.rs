//! Error types for the client coordination layer.

use brume_ipc::transport::RpcError;
use std::io;
use thiserror::Error;

/// Result type for coordination layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the coordination layer.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the daemon RPC boundary
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon launch error
    #[error("Failed to launch the daemon: {0}")]
    Launch(String),

    /// No service instance is running
    #[error("No service instance is running")]
    NotRunning,

    /// The coordinator was shut down before the operation could run
    #[error("The coordinator was shut down")]
    ShutDown,
}
