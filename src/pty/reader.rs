use std::io::Read;
use std::sync::Arc;

use crate::term::Parser;

use super::session::Session;

/// Spawn the PTY reader thread for a session.
///
/// The reader owns the parser. Every chunk goes through the output ring,
/// the screen buffer, and the subscriber fan-out in arrival order, so
/// subscribers observe output exactly as the PTY produced it. On EOF or a
/// read error the child's exit status is reaped and the session
/// transitions to Exited.
pub(crate) fn spawn_reader(
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
) -> std::thread::JoinHandle<()> {
    let name = format!(
        "pty-reader-{}",
        session.id().chars().take(8).collect::<String>()
    );
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut parser = Parser::new();
            let mut buf = [0u8; 4096];

            while session.is_running() {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!(session = %session.id(), "pty reader EOF");
                        break;
                    }
                    Ok(n) => session.process_chunk(&mut parser, &buf[..n]),
                    Err(e) => {
                        if session.is_running() {
                            tracing::warn!(session = %session.id(), "pty read error: {}", e);
                        }
                        break;
                    }
                }
            }

            // The session survives PTY failure as a clean exit: subscribers
            // see end-of-stream plus an exit event, not an error.
            let exit_code = session.reap_exit_code();
            session.mark_exited(exit_code);
        })
        .expect("failed to spawn pty reader thread")
}
