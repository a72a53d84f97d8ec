//! Framed IPC transport
//!
//! Frames are a `u32` little-endian length prefix followed by a bincode body,
//! carried over a Unix domain socket. The stream is split so that a reader
//! task can wait for daemon messages while requests are written concurrently.

use crate::messages::{DaemonMessage, RequestEnvelope};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};

/// Sanity cap on frame size to prevent OOM on a corrupt prefix.
const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// How long a frame write may take before the connection is considered dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Error type for RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Failure reported by the daemon itself
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// The connection to the daemon was closed
    #[error("Connection to the daemon was closed")]
    Closed,
}

/// Writing half of a daemon connection.
pub struct TransportWriter {
    stream: OwnedWriteHalf,
}

/// Reading half of a daemon connection.
pub struct TransportReader {
    stream: OwnedReadHalf,
}

/// Connect to the daemon socket at the given path.
pub async fn connect<P: AsRef<Path>>(path: P) -> RpcResult<(TransportReader, TransportWriter)> {
    let stream = UnixStream::connect(path.as_ref())
        .await
        .map_err(|e| RpcError::Connection(format!("Failed to connect to socket: {}", e)))?;

    Ok(from_stream(stream))
}

/// Wrap an already established stream. Used by tests to drive both ends of a
/// socket pair.
pub fn from_stream(stream: UnixStream) -> (TransportReader, TransportWriter) {
    let (read, write) = stream.into_split();
    (
        TransportReader { stream: read },
        TransportWriter { stream: write },
    )
}

impl TransportWriter {
    /// Send one request frame.
    pub async fn send_request(&mut self, envelope: &RequestEnvelope) -> RpcResult<()> {
        let data = bincode::serialize(envelope)?;
        self.write_frame(&data).await
    }

    async fn write_frame(&mut self, data: &[u8]) -> RpcResult<()> {
        let len = data.len() as u32;

        match timeout(WRITE_TIMEOUT, self.stream.write_all(&len.to_le_bytes())).await {
            Ok(result) => result.map_err(RpcError::Io)?,
            Err(_) => return Err(RpcError::Timeout("Write operation timed out".to_string())),
        }

        match timeout(WRITE_TIMEOUT, self.stream.write_all(data)).await {
            Ok(result) => result.map_err(RpcError::Io)?,
            Err(_) => return Err(RpcError::Timeout("Write operation timed out".to_string())),
        }

        Ok(())
    }
}

impl TransportReader {
    /// Receive the next daemon message. Returns `None` on a clean end of
    /// stream. There is deliberately no read timeout: push events arrive
    /// whenever the daemon has something to say.
    pub async fn next_message(&mut self) -> RpcResult<Option<DaemonMessage>> {
        let data = match self.read_frame().await? {
            Some(data) => data,
            None => return Ok(None),
        };

        let message = bincode::deserialize(&data)?;
        Ok(Some(message))
    }

    async fn read_frame(&mut self) -> RpcResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(RpcError::Io(e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::Protocol(format!(
                "Frame too large: {} bytes",
                len
            )));
        }

        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data).await?;

        Ok(Some(data))
    }
}

/// Counterpart used by a daemon (or a test standing in for one) to frame its
/// side of the conversation.
pub struct DaemonSideTransport {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
}

impl DaemonSideTransport {
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self { read, write }
    }

    /// Receive the next request frame. Returns `None` on end of stream.
    pub async fn next_request(&mut self) -> RpcResult<Option<RequestEnvelope>> {
        let mut len_buf = [0u8; 4];
        match self.read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(RpcError::Io(e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::Protocol(format!(
                "Frame too large: {} bytes",
                len
            )));
        }

        let mut data = vec![0u8; len];
        self.read.read_exact(&mut data).await?;

        let envelope = bincode::deserialize(&data)?;
        Ok(Some(envelope))
    }

    /// Send one daemon message frame.
    pub async fn send_message(&mut self, message: &DaemonMessage) -> RpcResult<()> {
        let data = bincode::serialize(message)?;
        let len = data.len() as u32;

        self.write.write_all(&len.to_le_bytes()).await?;
        self.write.write_all(&data).await?;

        Ok(())
    }
}
