use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pty::session::SessionInfo;
use crate::pty::SpawnOptions;

/// Every frame payload on the wire. The `type` tag makes each frame
/// self-describing; binary fields travel inside the JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ListRequest,
    ListResponse {
        sessions: Vec<SessionInfo>,
    },
    CreateRequest {
        id: String,
        options: SpawnOptions,
    },
    CreateResponse {
        session: SessionInfo,
    },
    AttachRequest {
        id: String,
        /// The attaching client's terminal size, applied to the session
        /// when both are present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default = "default_primary")]
        primary: bool,
    },
    AttachResponse {
        session: SessionInfo,
        /// Screen replay bootstrapping the late attacher.
        buffered_output: Vec<u8>,
    },
    InputFrame {
        bytes: Vec<u8>,
    },
    ResizeFrame {
        cols: u16,
        rows: u16,
    },
    DetachRequest,
    /// Confirms a detach once the output stream has quiesced, returning
    /// the connection to request/response mode.
    DetachResponse,
    OutputFrame {
        bytes: Vec<u8>,
    },
    ExitFrame {
        exit_code: Option<i32>,
    },
    KillRequest {
        id: String,
        #[serde(default)]
        force: bool,
    },
    KillResponse {
        killed: bool,
    },
    ErrorResponse {
        kind: ErrorKind,
        message: String,
    },
}

fn default_primary() -> bool {
    true
}

impl Message {
    /// Wire tag of this message, for logs and protocol errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::ListRequest => "list_request",
            Message::ListResponse { .. } => "list_response",
            Message::CreateRequest { .. } => "create_request",
            Message::CreateResponse { .. } => "create_response",
            Message::AttachRequest { .. } => "attach_request",
            Message::AttachResponse { .. } => "attach_response",
            Message::InputFrame { .. } => "input_frame",
            Message::ResizeFrame { .. } => "resize_frame",
            Message::DetachRequest => "detach_request",
            Message::DetachResponse => "detach_response",
            Message::OutputFrame { .. } => "output_frame",
            Message::ExitFrame { .. } => "exit_frame",
            Message::KillRequest { .. } => "kill_request",
            Message::KillResponse { .. } => "kill_response",
            Message::ErrorResponse { .. } => "error_response",
        }
    }

    /// Build the error response for a failed operation.
    pub fn error(err: &Error) -> Message {
        Message::ErrorResponse {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Wire form of the crate's error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotFound,
    SessionAlreadyExists,
    AlreadyAttached,
    SessionNotRunning,
    ConnectFailed,
    Framing,
    Protocol,
    SpawnFailed,
    SlowConsumer,
    Cancelled,
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::SessionAlreadyExists(_) => ErrorKind::SessionAlreadyExists,
            Error::AlreadyAttached(_) => ErrorKind::AlreadyAttached,
            Error::SessionNotRunning(_) => ErrorKind::SessionNotRunning,
            Error::ConnectFailed(_) | Error::UnsupportedEndpoint(_) => ErrorKind::ConnectFailed,
            Error::Framing(_) => ErrorKind::Framing,
            Error::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Error::SlowConsumer => ErrorKind::SlowConsumer,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Protocol(_) | Error::Io(_) => ErrorKind::Protocol,
        }
    }
}

impl ErrorKind {
    /// Reconstruct a typed error on the client side of the wire.
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::SessionNotFound => Error::SessionNotFound(message),
            ErrorKind::SessionAlreadyExists => Error::SessionAlreadyExists(message),
            ErrorKind::AlreadyAttached => Error::AlreadyAttached(message),
            ErrorKind::SessionNotRunning => Error::SessionNotRunning(message),
            ErrorKind::ConnectFailed => Error::ConnectFailed(message),
            ErrorKind::Framing => Error::Framing(message),
            ErrorKind::Protocol => Error::Protocol(message),
            ErrorKind::SpawnFailed => Error::SpawnFailed(message),
            ErrorKind::SlowConsumer => Error::SlowConsumer,
            ErrorKind::Cancelled => Error::Cancelled,
        }
    }
}
