use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::frame;
use super::protocol::Message;
use crate::error::{Error, Result};
use crate::host::SessionHost;
use crate::pty::session::SessionEvent;

/// Accept loop for a TCP listener: one dispatcher thread per connection.
pub fn serve_tcp(listener: TcpListener, host: Arc<SessionHost>) {
    tracing::info!(addr = ?listener.local_addr().ok(), "listening (tcp)");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                match stream.try_clone() {
                    Ok(write_half) => spawn_connection(stream, write_half, Arc::clone(&host)),
                    Err(e) => tracing::warn!("failed to clone connection: {}", e),
                }
            }
            Err(e) => tracing::warn!("accept failed: {}", e),
        }
    }
}

/// Accept loop for a Unix-domain listener.
#[cfg(unix)]
pub fn serve_unix(listener: std::os::unix::net::UnixListener, host: Arc<SessionHost>) {
    tracing::info!(addr = ?listener.local_addr().ok(), "listening (unix)");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => match stream.try_clone() {
                Ok(write_half) => spawn_connection(stream, write_half, Arc::clone(&host)),
                Err(e) => tracing::warn!("failed to clone connection: {}", e),
            },
            Err(e) => tracing::warn!("accept failed: {}", e),
        }
    }
}

fn spawn_connection<R, W>(reader: R, writer: W, host: Arc<SessionHost>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    std::thread::Builder::new()
        .name("rpc-conn".into())
        .spawn(move || match serve_connection(reader, writer, host) {
            Ok(()) => tracing::debug!("connection closed"),
            Err(e) => tracing::debug!("connection closed with error: {}", e),
        })
        .expect("failed to spawn connection thread");
}

/// Serve one connection until it closes.
///
/// The connection starts in request/response mode; a successful attach
/// switches it to streaming mode until detach, session exit, or loss. The
/// writer is shared with the egress thread behind a mutex, interleaving at
/// frame granularity.
pub fn serve_connection<R, W>(mut reader: R, writer: W, host: Arc<SessionHost>) -> Result<()>
where
    R: Read,
    W: Write + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut pending: Option<Message> = None;

    loop {
        let message = match pending.take() {
            Some(message) => message,
            None => match frame::read_message(&mut reader) {
                Ok(message) => message,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e @ Error::Framing(_)) => {
                    let _ = frame::write_message(&mut *writer.lock(), &Message::error(&e));
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
        };

        match message {
            Message::ListRequest => {
                let sessions = host.list();
                frame::write_message(&mut *writer.lock(), &Message::ListResponse { sessions })?;
            }
            Message::CreateRequest { id, options } => {
                let response = match host.create(&id, options) {
                    Ok(session) => Message::CreateResponse { session },
                    Err(e) => Message::error(&e),
                };
                frame::write_message(&mut *writer.lock(), &response)?;
            }
            Message::KillRequest { id, force } => {
                let killed = host.kill(&id, force);
                frame::write_message(&mut *writer.lock(), &Message::KillResponse { killed })?;
            }
            Message::AttachRequest {
                id,
                cols,
                rows,
                primary,
            } => match stream_session(&mut reader, &writer, &host, id, cols, rows, primary) {
                Ok(carry_over) => pending = carry_over,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            // Anything else is either server→client or only valid while
            // attached: a protocol error, fatal for the connection.
            other => {
                let err = Error::Protocol(format!(
                    "unexpected {} in request mode",
                    other.kind_name()
                ));
                let _ = frame::write_message(&mut *writer.lock(), &Message::error(&err));
                return Err(err);
            }
        }
    }
}

/// Handle one attachment: reply, then pump events outbound while accepting
/// input/resize/detach inbound. Returns a carried-over request when the
/// client moved back to request/response mode after the stream ended.
fn stream_session<R, W>(
    reader: &mut R,
    writer: &Arc<Mutex<W>>,
    host: &Arc<SessionHost>,
    id: String,
    cols: Option<u16>,
    rows: Option<u16>,
    primary: bool,
) -> Result<Option<Message>>
where
    R: Read,
    W: Write + Send + 'static,
{
    let session = match host.get(&id) {
        Some(session) => session,
        None => {
            let err = Error::SessionNotFound(id);
            frame::write_message(&mut *writer.lock(), &Message::error(&err))?;
            return Ok(None);
        }
    };

    // The attaching client announces its terminal size.
    if let (Some(cols), Some(rows)) = (cols, rows) {
        if session.size() != (cols, rows) {
            if let Err(e) = session.resize(cols, rows) {
                tracing::debug!(session = %session.id(), "resize on attach failed: {}", e);
            }
        }
    }

    let mut attachment = match session.attach(primary) {
        Ok(attachment) => attachment,
        // The connection stays usable for further requests (e.g. a second
        // primary attach elsewhere).
        Err(e) => {
            frame::write_message(&mut *writer.lock(), &Message::error(&e))?;
            return Ok(None);
        }
    };

    let buffered_output = attachment.take_buffered_output();
    frame::write_message(
        &mut *writer.lock(),
        &Message::AttachResponse {
            session: session.descriptor(),
            buffered_output,
        },
    )?;

    let subscriber_id = attachment.subscriber_id();
    let events = attachment.into_events();

    let stream_done = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let detaching = Arc::new(AtomicBool::new(false));

    let egress_writer = Arc::clone(writer);
    let egress_done = Arc::clone(&stream_done);
    let egress_exited = Arc::clone(&exited);
    let egress_detaching = Arc::clone(&detaching);
    let egress = std::thread::Builder::new()
        .name("rpc-egress".into())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    SessionEvent::Output(bytes) => {
                        let message = Message::OutputFrame { bytes };
                        if frame::write_message(&mut *egress_writer.lock(), &message).is_err() {
                            break;
                        }
                    }
                    SessionEvent::Exited(exit_code) => {
                        // Every output frame queued before the exit has
                        // already been written above.
                        egress_exited.store(true, Ordering::Release);
                        let message = Message::ExitFrame { exit_code };
                        let _ = frame::write_message(&mut *egress_writer.lock(), &message);
                        break;
                    }
                }
            }
            // A stream that ends without exit or an explicit detach means
            // the session dropped us as a slow consumer.
            if !egress_exited.load(Ordering::Acquire) && !egress_detaching.load(Ordering::Acquire) {
                let _ = frame::write_message(
                    &mut *egress_writer.lock(),
                    &Message::error(&Error::SlowConsumer),
                );
            }
            egress_done.store(true, Ordering::Release);
        })
        .expect("failed to spawn egress thread");

    let mut result: Result<Option<Message>> = Ok(None);
    let mut explicit_detach = false;
    loop {
        let message = match frame::read_message(reader) {
            Ok(message) => message,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        match message {
            Message::InputFrame { bytes } => {
                if let Err(e) = session.send_input(&bytes) {
                    tracing::debug!(session = %session.id(), "input dropped: {}", e);
                }
            }
            Message::ResizeFrame { cols, rows } => {
                if let Err(e) = session.resize(cols, rows) {
                    tracing::debug!(session = %session.id(), "resize dropped: {}", e);
                }
            }
            Message::DetachRequest => {
                explicit_detach = true;
                break;
            }
            request @ (Message::ListRequest
            | Message::CreateRequest { .. }
            | Message::AttachRequest { .. }
            | Message::KillRequest { .. }) => {
                if stream_done.load(Ordering::Acquire) {
                    // The stream already ended (exit or slow-consumer
                    // drop); the client has resumed request/response mode.
                    result = Ok(Some(request));
                    break;
                }
                let err = Error::Protocol(format!(
                    "unexpected {} while attached",
                    request.kind_name()
                ));
                let _ = frame::write_message(&mut *writer.lock(), &Message::error(&err));
                result = Err(err);
                break;
            }
            other => {
                let err = Error::Protocol(format!(
                    "unexpected {} while attached",
                    other.kind_name()
                ));
                let _ = frame::write_message(&mut *writer.lock(), &Message::error(&err));
                result = Err(err);
                break;
            }
        }
    }

    // Tear down the subscription; dropping the sender ends the egress
    // thread if the exit event has not already done so.
    detaching.store(true, Ordering::Release);
    session.detach(subscriber_id);
    let _ = egress.join();

    if explicit_detach {
        frame::write_message(&mut *writer.lock(), &Message::DetachResponse)?;
    }
    result
}
