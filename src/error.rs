use thiserror::Error;

/// Errors surfaced by the multiplexer core.
///
/// Variants mirror the error kinds carried on the wire (see
/// `ipc::protocol::ErrorKind`), plus `Io` for transport-level failures and
/// `UnsupportedEndpoint` for client connection strings we do not bind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("a primary client is already attached to session {0}")]
    AlreadyAttached(String),

    #[error("session {0} is not running")]
    SessionNotRunning(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Oversized, truncated, or malformed frame. Always fatal for the
    /// connection that produced it.
    #[error("framing error: {0}")]
    Framing(String),

    /// Valid framing but an unexpected message sequence, e.g. input before
    /// attach. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// The subscriber's outbound channel stayed full; it was dropped so the
    /// PTY reader could make progress.
    #[error("subscriber dropped: output consumed too slowly")]
    SlowConsumer,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
