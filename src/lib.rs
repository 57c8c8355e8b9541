//! Squall: terminal session multiplexer core.
//!
//! A [`SessionHost`] owns PTY-backed sessions; each session mirrors its
//! output into a cell-accurate [`ScreenBuffer`] via the VT parser, so a
//! late-attaching client is bootstrapped from the current screen rather
//! than the full output history. Attached clients stream over a framed
//! RPC protocol (`ipc`): 4-byte big-endian length prefix plus a tagged
//! JSON payload, carried on TCP or Unix-domain sockets.
//!
//! The front-end concerns (raw-mode TTY setup, key encoding,
//! daemonization, PID files) live in the embedding application.

pub mod error;
pub mod host;
pub mod ipc;
pub mod pty;
pub mod term;

pub use error::{Error, Result};
pub use host::{HostConfig, SessionHost};
pub use ipc::client::{Client, ClientAttachment};
pub use pty::session::{Attachment, Session, SessionEvent, SessionInfo, SessionState};
pub use pty::SpawnOptions;
pub use term::{Parser, Perform, ScreenBuffer};

/// Initialize tracing for a host process. `RUST_LOG` overrides the default
/// filter.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "squall=info".into()),
        )
        .init();
}
