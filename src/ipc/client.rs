use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::frame;
use super::protocol::Message;
use crate::error::{Error, Result};
use crate::pty::session::SessionInfo;
use crate::pty::SpawnOptions;

/// Transport carrying the framed protocol. The listener variety the server
/// binds is mirrored here: TCP and Unix-domain sockets.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    fn try_clone(&self) -> Result<ClientStream> {
        Ok(match self {
            ClientStream::Tcp(stream) => ClientStream::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            ClientStream::Unix(stream) => ClientStream::Unix(stream.try_clone()?),
        })
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.flush(),
        }
    }
}

/// Blocking client stub for the framed RPC protocol.
///
/// While an attachment obtained from [`Client::attach`] is live, the client
/// must stay idle; it becomes usable again once the attachment detaches.
#[derive(Debug)]
pub struct Client {
    stream: ClientStream,
}

impl Client {
    /// Connect to an endpoint URI: `tcp://host:port` or `unix:///path`.
    /// Schemes this client does not bind (`ws://`, `pipe://`, ...) are
    /// rejected as unsupported.
    pub fn connect(endpoint: &str, timeout: Option<Duration>) -> Result<Client> {
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let stream = connect_tcp(addr, timeout)?;
            let _ = stream.set_nodelay(true);
            return Ok(Client {
                stream: ClientStream::Tcp(stream),
            });
        }
        #[cfg(unix)]
        if let Some(path) = endpoint.strip_prefix("unix://") {
            let stream = UnixStream::connect(path)
                .map_err(|e| Error::ConnectFailed(format!("{}: {}", path, e)))?;
            return Ok(Client {
                stream: ClientStream::Unix(stream),
            });
        }
        Err(Error::UnsupportedEndpoint(endpoint.to_string()))
    }

    /// Read timeout for responses and streamed frames (shared with any
    /// attachment cloned from this connection).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn request(&mut self, message: &Message) -> Result<Message> {
        frame::write_message(&mut self.stream, message)?;
        match frame::read_message(&mut self.stream)? {
            Message::ErrorResponse { kind, message } => Err(kind.into_error(message)),
            other => Ok(other),
        }
    }

    pub fn list(&mut self) -> Result<Vec<SessionInfo>> {
        match self.request(&Message::ListRequest)? {
            Message::ListResponse { sessions } => Ok(sessions),
            other => Err(unexpected(&other)),
        }
    }

    pub fn create(&mut self, id: &str, options: SpawnOptions) -> Result<SessionInfo> {
        let message = Message::CreateRequest {
            id: id.to_string(),
            options,
        };
        match self.request(&message)? {
            Message::CreateResponse { session } => Ok(session),
            other => Err(unexpected(&other)),
        }
    }

    pub fn kill(&mut self, id: &str, force: bool) -> Result<bool> {
        let message = Message::KillRequest {
            id: id.to_string(),
            force,
        };
        match self.request(&message)? {
            Message::KillResponse { killed } => Ok(killed),
            other => Err(unexpected(&other)),
        }
    }

    /// Attach to a session, switching this connection into streaming mode.
    /// `size` announces the client terminal's (cols, rows).
    pub fn attach(
        &mut self,
        id: &str,
        size: Option<(u16, u16)>,
        primary: bool,
    ) -> Result<ClientAttachment> {
        let (cols, rows) = match size {
            Some((cols, rows)) => (Some(cols), Some(rows)),
            None => (None, None),
        };
        let message = Message::AttachRequest {
            id: id.to_string(),
            cols,
            rows,
            primary,
        };
        match self.request(&message)? {
            Message::AttachResponse {
                session,
                buffered_output,
            } => {
                let reader = self.stream.try_clone()?;
                let writer = self.stream.try_clone()?;
                Ok(ClientAttachment {
                    reader,
                    writer: Arc::new(Mutex::new(writer)),
                    session,
                    buffered_output,
                    exit_code: None,
                    finished: false,
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// [`Client::attach`] for a connection dedicated to one attachment.
    pub fn attach_owned(
        mut self,
        id: &str,
        size: Option<(u16, u16)>,
        primary: bool,
    ) -> Result<ClientAttachment> {
        self.attach(id, size, primary)
    }
}

/// Streaming side of an attached connection.
///
/// Reads happen on [`ClientAttachment::read_chunk`]; input and resize may
/// be sent concurrently from another thread through the shared writer.
#[derive(Debug)]
pub struct ClientAttachment {
    reader: ClientStream,
    writer: Arc<Mutex<ClientStream>>,
    session: SessionInfo,
    buffered_output: Vec<u8>,
    exit_code: Option<i32>,
    finished: bool,
}

impl ClientAttachment {
    /// Descriptor captured at attach time.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Screen replay bootstrapping this attachment; render it before the
    /// live chunks.
    pub fn take_buffered_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffered_output)
    }

    pub fn send_input(&self, bytes: &[u8]) -> Result<()> {
        frame::write_message(
            &mut *self.writer.lock(),
            &Message::InputFrame {
                bytes: bytes.to_vec(),
            },
        )
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        frame::write_message(&mut *self.writer.lock(), &Message::ResizeFrame { cols, rows })
    }

    /// Next output chunk, in PTY order. Ok(None) once the stream ends: on
    /// session exit ([`ClientAttachment::exit_code`] is then set), or on
    /// connection loss.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match frame::read_message(&mut self.reader) {
            Ok(Message::OutputFrame { bytes }) => Ok(Some(bytes)),
            Ok(Message::ExitFrame { exit_code }) => {
                self.exit_code = exit_code;
                self.finished = true;
                Ok(None)
            }
            Ok(Message::ErrorResponse { kind, message }) => {
                self.finished = true;
                Err(kind.into_error(message))
            }
            Ok(other) => Err(unexpected(&other)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// True once the output stream has ended.
    pub fn stream_ended(&self) -> bool {
        self.finished
    }

    /// Exit code from the final frame, when the session exited while
    /// attached.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Detach from the session and drain the stream. The connection (and
    /// the [`Client`] it came from) returns to request/response mode.
    pub fn detach(mut self) -> Result<()> {
        frame::write_message(&mut *self.writer.lock(), &Message::DetachRequest)?;
        loop {
            match frame::read_message(&mut self.reader)? {
                Message::DetachResponse => return Ok(()),
                Message::OutputFrame { .. } => continue,
                Message::ExitFrame { exit_code } => {
                    self.exit_code = exit_code;
                    self.finished = true;
                }
                Message::ErrorResponse { kind, message } => return Err(kind.into_error(message)),
                other => return Err(unexpected(&other)),
            }
        }
    }
}

fn connect_tcp(addr: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| Error::ConnectFailed(format!("{}: {}", addr, e)))?
        .collect();
    let mut last_error = None;
    for addr in &addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(Error::ConnectFailed(match last_error {
        Some(e) => format!("{}: {}", addr, e),
        None => format!("{}: no addresses resolved", addr),
    }))
}

fn unexpected(message: &Message) -> Error {
    Error::Protocol(format!("unexpected response: {}", message.kind_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_schemes_are_rejected() {
        for endpoint in ["ws://localhost:9000/", "pipe://squall", "ftp://x", "bare"] {
            assert!(matches!(
                Client::connect(endpoint, None),
                Err(Error::UnsupportedEndpoint(_))
            ));
        }
    }

    #[test]
    fn tcp_connect_failure_is_typed() {
        // A port from the reserved block nothing listens on.
        let err = Client::connect("tcp://127.0.0.1:1", Some(Duration::from_millis(200)))
            .expect_err("connect should fail");
        assert!(matches!(err, Error::ConnectFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn unix_connect_failure_is_typed() {
        let err = Client::connect("unix:///nonexistent/squall.sock", None)
            .expect_err("connect should fail");
        assert!(matches!(err, Error::ConnectFailed(_)));
    }
}
