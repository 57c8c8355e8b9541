use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use portable_pty::{Child, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ring::OutputRing;
use super::SpawnOptions;
use crate::error::{Error, Result};
use crate::term::{Parser, ScreenBuffer};

/// Shared writer handle so both client input and the reader thread
/// (DSR/DA responses) can write to the PTY.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Shared child handle so the reader thread can reap the exit status after
/// EOF while `kill` signals from another thread.
pub type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// One event on a subscriber's channel. Output chunks arrive in PTY order;
/// `Exited` is always the last event delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    Exited(Option<i32>),
}

/// Session descriptor returned over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: u64,
}

struct Subscriber {
    id: Uuid,
    tx: Sender<SessionEvent>,
}

struct SubscriberSet {
    subscribers: Vec<Subscriber>,
    /// At most one primary attachment per session.
    primary: Option<Uuid>,
}

struct Lifecycle {
    state: SessionState,
    exit_code: Option<i32>,
    exited_at: Option<Instant>,
}

/// A live terminal session tying together the PTY, the screen-buffer
/// mirror, the output ring, and the subscriber set.
///
/// Lock order where multiple are held: lifecycle before subscribers,
/// screen before master/writer.
pub struct Session {
    id: String,
    options: SpawnOptions,
    created_at: u64,
    /// Master PTY handle for resizes (Option so kill can close it and
    /// unblock the reader with EOF).
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: SharedChild,
    writer: SharedWriter,
    screen: Mutex<ScreenBuffer>,
    ring: Mutex<OutputRing>,
    size: Mutex<(u16, u16)>,
    subscribers: Mutex<SubscriberSet>,
    lifecycle: Mutex<Lifecycle>,
    exited: Condvar,
    idle_deadline: Mutex<Option<Instant>>,
    channel_capacity: usize,
    running: Arc<AtomicBool>,
    reader_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Session {
    /// Spawn the PTY child and start the reader thread.
    pub(crate) fn spawn(
        id: String,
        mut options: SpawnOptions,
        channel_capacity: usize,
        ring_capacity: usize,
    ) -> Result<Arc<Self>> {
        options.cols = options.cols.max(1);
        options.rows = options.rows.max(1);
        let spawned = super::spawn_pty(&options)?;
        let (cols, rows) = (options.cols, options.rows);

        let session = Arc::new(Session {
            id,
            created_at: unix_now_secs(),
            master: Mutex::new(Some(spawned.master)),
            child: Arc::new(Mutex::new(spawned.child)),
            writer: Arc::new(Mutex::new(spawned.writer)),
            screen: Mutex::new(ScreenBuffer::new(cols, rows)),
            ring: Mutex::new(OutputRing::new(ring_capacity)),
            size: Mutex::new((cols, rows)),
            subscribers: Mutex::new(SubscriberSet {
                subscribers: Vec::new(),
                primary: None,
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Starting,
                exit_code: None,
                exited_at: None,
            }),
            exited: Condvar::new(),
            idle_deadline: Mutex::new(None),
            channel_capacity: channel_capacity.max(1),
            running: Arc::new(AtomicBool::new(true)),
            reader_handle: Mutex::new(None),
            options,
        });

        session.touch_idle();
        let handle = super::reader::spawn_reader(Arc::clone(&session), spawned.reader);
        *session.reader_handle.lock() = Some(handle);
        session.lifecycle.lock().state = SessionState::Running;
        tracing::info!(
            session = %session.id,
            command = %session.options.command,
            cols,
            rows,
            "session started"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lifecycle.lock().exit_code
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn descriptor(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        let lifecycle = self.lifecycle.lock();
        SessionInfo {
            id: self.id.clone(),
            command: self.options.command.clone(),
            working_directory: self.options.cwd.clone(),
            cols,
            rows,
            state: lifecycle.state,
            exit_code: lifecycle.exit_code,
            created_at: self.created_at,
        }
    }

    /// Raw byte history from the output ring. Informational; attach replay
    /// uses the screen serialization instead.
    pub fn ring_snapshot(&self) -> Vec<u8> {
        self.ring.lock().snapshot()
    }

    /// ANSI serialization of the current screen (see
    /// [`ScreenBuffer::replay_bytes`]).
    pub fn screen_replay(&self) -> Vec<u8> {
        self.screen.lock().replay_bytes()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            SessionState::Running => Ok(()),
            _ => Err(Error::SessionNotRunning(self.id.clone())),
        }
    }

    /// Write input bytes to the child. Serialized per session by the
    /// writer lock; safe under concurrent callers.
    pub fn send_input(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        {
            let mut writer = self.writer.lock();
            writer.write_all(bytes)?;
            writer.flush()?;
        }
        self.touch_idle();
        Ok(())
    }

    /// Resize the PTY and re-render the screen into a buffer of the new
    /// size. Subscribers receive a fresh replay so attached clients repaint.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.ensure_running()?;
        let (cols, rows) = (cols.max(1), rows.max(1));
        {
            let mut screen = self.screen.lock();
            let replay = screen.replay_bytes();
            let mut next = ScreenBuffer::new(cols, rows);
            let mut parser = Parser::new();
            parser.parse(&mut next, &replay);
            *screen = next;
            // Resize the PTY while still holding the screen lock so the
            // reader never parses bytes against mismatched dimensions.
            let master = self.master.lock();
            if let Some(master) = master.as_ref() {
                master
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|e| {
                        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                    })?;
            }
        }
        *self.size.lock() = (cols, rows);
        tracing::debug!(session = %self.id, cols, rows, "session resized");
        self.broadcast(SessionEvent::Output(self.screen_replay()));
        Ok(())
    }

    /// Register a subscriber. Fails with `AlreadyAttached` when a primary
    /// attachment is requested and the slot is taken. An Exited session
    /// still attaches; the subscriber sees the final screen and an
    /// immediate exit event.
    pub fn attach(&self, primary: bool) -> Result<Attachment> {
        let lifecycle = self.lifecycle.lock();
        let mut subs = self.subscribers.lock();
        if primary && subs.primary.is_some() {
            return Err(Error::AlreadyAttached(self.id.clone()));
        }
        let (tx, rx) = bounded(self.channel_capacity);
        if lifecycle.state == SessionState::Exited {
            let _ = tx.send(SessionEvent::Exited(lifecycle.exit_code));
        }
        let id = Uuid::new_v4();
        subs.subscribers.push(Subscriber { id, tx });
        if primary {
            subs.primary = Some(id);
        }
        drop(subs);
        drop(lifecycle);

        tracing::debug!(session = %self.id, subscriber = %id, primary, "subscriber attached");
        Ok(Attachment {
            subscriber_id: id,
            session_id: self.id.clone(),
            events: rx,
            buffered_output: self.screen_replay(),
        })
    }

    /// Remove a subscriber, releasing the primary slot if it held it.
    pub fn detach(&self, subscriber: Uuid) {
        let mut subs = self.subscribers.lock();
        let before = subs.subscribers.len();
        subs.subscribers.retain(|s| s.id != subscriber);
        if subs.primary == Some(subscriber) {
            subs.primary = None;
        }
        if subs.subscribers.len() != before {
            tracing::debug!(session = %self.id, subscriber = %subscriber, "subscriber detached");
        }
    }

    /// Multicast an event to every subscriber. Never blocks: a subscriber
    /// whose channel is full is dropped (slow-consumer policy) so the PTY
    /// reader keeps making progress.
    pub(crate) fn broadcast(&self, event: SessionEvent) {
        let mut subs = self.subscribers.lock();
        let mut dropped: Vec<Uuid> = Vec::new();
        for sub in &subs.subscribers {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        session = %self.id,
                        subscriber = %sub.id,
                        "dropping slow subscriber"
                    );
                    dropped.push(sub.id);
                }
                Err(TrySendError::Disconnected(_)) => dropped.push(sub.id),
            }
        }
        if !dropped.is_empty() {
            subs.subscribers.retain(|s| !dropped.contains(&s.id));
            if let Some(primary) = subs.primary {
                if dropped.contains(&primary) {
                    subs.primary = None;
                }
            }
        }
    }

    /// Block until the child exits; returns its exit code (None when the
    /// PTY failed without a reapable status).
    pub fn wait_for_exit(&self) -> Option<i32> {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state != SessionState::Exited {
            self.exited.wait(&mut lifecycle);
        }
        lifecycle.exit_code
    }

    /// Like [`Session::wait_for_exit`] with an upper bound; None on timeout.
    pub fn wait_for_exit_timeout(&self, timeout: Duration) -> Option<Option<i32>> {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state != SessionState::Exited {
            if self.exited.wait_until(&mut lifecycle, deadline).timed_out() {
                return None;
            }
        }
        Some(lifecycle.exit_code)
    }

    /// Terminate the child: SIGHUP first, escalating to a process-group
    /// SIGKILL when `force` is set and the child lingers. The master is
    /// closed so the reader thread unblocks with EOF and reaps the status.
    pub fn kill(&self, force: bool) {
        tracing::info!(session = %self.id, force, "killing session");
        self.running.store(false, Ordering::Release);
        {
            let mut child = self.child.lock();
            let pid = child.process_id();
            let _ = child.kill();
            if force {
                let deadline = Instant::now() + Duration::from_millis(200);
                let mut exited = false;
                while Instant::now() < deadline {
                    if let Ok(Some(_)) = child.try_wait() {
                        exited = true;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                if !exited {
                    #[cfg(unix)]
                    if let Some(raw_pid) = pid {
                        unsafe {
                            // Kill the process group (negative pid), then the
                            // process directly in case it changed groups.
                            libc::kill(-(raw_pid as i32), libc::SIGKILL);
                            libc::kill(raw_pid as i32, libc::SIGKILL);
                        }
                    }
                    #[cfg(not(unix))]
                    let _ = pid;
                    let _ = child.try_wait();
                }
            }
        }

        drop(self.master.lock().take());

        let handle = self.reader_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Record the exit and deliver the final event. Broadcasting under the
    /// lifecycle lock keeps a concurrent attach from missing the exit.
    pub(crate) fn mark_exited(&self, exit_code: Option<i32>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Exited {
            return;
        }
        lifecycle.state = SessionState::Exited;
        lifecycle.exit_code = exit_code;
        lifecycle.exited_at = Some(Instant::now());
        self.broadcast(SessionEvent::Exited(exit_code));
        self.exited.notify_all();
        tracing::info!(session = %self.id, exit_code = ?exit_code, "session exited");
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Feed one PTY chunk through the ring, the screen, and the fan-out,
    /// then flush any queued device reports back to the child.
    pub(crate) fn process_chunk(&self, parser: &mut Parser, chunk: &[u8]) {
        self.ring.lock().write(chunk);
        let responses = {
            let mut screen = self.screen.lock();
            parser.parse(&mut *screen, chunk);
            screen.take_pending_responses()
        };
        if !responses.is_empty() {
            let mut writer = self.writer.lock();
            for response in &responses {
                let _ = writer.write_all(response);
            }
            let _ = writer.flush();
        }
        self.touch_idle();
        self.broadcast(SessionEvent::Output(chunk.to_vec()));
    }

    /// Reap the child's exit status, giving it a moment to settle after
    /// EOF. None when no status could be collected.
    pub(crate) fn reap_exit_code(&self) -> Option<i32> {
        for _ in 0..20 {
            match self.child.lock().try_wait() {
                Ok(Some(status)) => return Some(status.exit_code() as i32),
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(_) => break,
            }
        }
        None
    }

    pub(crate) fn touch_idle(&self) {
        if let Some(timeout) = self.options.idle_timeout() {
            *self.idle_deadline.lock() = Some(Instant::now() + timeout);
        }
    }

    pub(crate) fn idle_expired(&self, now: Instant) -> bool {
        self.state() == SessionState::Running
            && self.idle_deadline.lock().map_or(false, |deadline| now > deadline)
    }

    /// True once the session has been Exited for longer than `grace`.
    pub(crate) fn reapable(&self, grace: Duration, now: Instant) -> bool {
        self.lifecycle
            .lock()
            .exited_at
            .map_or(false, |at| now.saturating_duration_since(at) > grace)
    }
}

/// A registered subscriber's handle: the buffered late-attach output plus
/// the live event channel.
///
/// Dropping the attachment cancels the subscription: the session notices
/// the closed channel on its next multicast and removes the subscriber.
/// Use [`Session::detach`] for prompt removal (e.g. to free the primary
/// slot immediately).
pub struct Attachment {
    subscriber_id: Uuid,
    session_id: String,
    events: Receiver<SessionEvent>,
    buffered_output: Vec<u8>,
}

impl Attachment {
    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Screen replay capturing everything up to the attach.
    pub fn take_buffered_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffered_output)
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn into_events(self) -> Receiver<SessionEvent> {
        self.events
    }

    /// Blocking iterator over output chunks, in PTY order. Ends at session
    /// exit or when the subscriber is dropped/cancelled.
    pub fn chunks(self) -> impl Iterator<Item = Vec<u8>> {
        self.events.into_iter().map_while(|event| match event {
            SessionEvent::Output(bytes) => Some(bytes),
            SessionEvent::Exited(_) => None,
        })
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pty::ring::DEFAULT_RING_CAPACITY;

    fn shell(script: &str) -> SpawnOptions {
        let mut options = SpawnOptions::new("/bin/sh");
        options.args = vec!["-c".into(), script.into()];
        options.cols = 80;
        options.rows = 24;
        options
    }

    fn spawn(script: &str) -> Arc<Session> {
        Session::spawn(
            format!("test-{}", Uuid::new_v4()),
            shell(script),
            64,
            DEFAULT_RING_CAPACITY,
        )
        .expect("spawn session")
    }

    fn collect_until(attachment: &Attachment, needle: &str, initial: Vec<u8>) -> Vec<u8> {
        let mut data = initial;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !String::from_utf8_lossy(&data).contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match attachment.events().recv_timeout(remaining) {
                Ok(SessionEvent::Output(bytes)) => data.extend_from_slice(&bytes),
                Ok(SessionEvent::Exited(_)) => break,
                Err(_) => break,
            }
        }
        data
    }

    #[test]
    fn spawn_failure_is_typed() {
        let err = Session::spawn(
            "nope".into(),
            SpawnOptions::new("/definitely/not/a/real/binary"),
            64,
            DEFAULT_RING_CAPACITY,
        )
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, Error::SpawnFailed(_)));
    }

    #[test]
    fn output_reaches_subscriber_and_screen() {
        let session = spawn("printf 'squall-out'; exec sleep 30");
        let mut attachment = session.attach(true).expect("attach");
        let buffered = attachment.take_buffered_output();
        let data = collect_until(&attachment, "squall-out", buffered);
        assert!(String::from_utf8_lossy(&data).contains("squall-out"));
        // The screen mirror saw the same bytes.
        let replay = session.screen_replay();
        assert!(String::from_utf8_lossy(&replay).contains("squall-out"));
        session.kill(true);
        assert!(session.wait_for_exit_timeout(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn input_round_trips_through_the_child() {
        let session = spawn("read line; printf 'got:%s' \"$line\"; exec sleep 30");
        let attachment = session.attach(true).expect("attach");
        session.send_input(b"ping\n").expect("input");
        let data = collect_until(&attachment, "got:ping", Vec::new());
        assert!(String::from_utf8_lossy(&data).contains("got:ping"));
        session.kill(true);
    }

    #[test]
    fn exit_event_follows_output() {
        let session = spawn("printf 'bye'");
        let attachment = session.attach(true).expect("attach");
        let mut saw_exit = false;
        let deadline = Instant::now() + Duration::from_secs(10);
        while let Ok(event) = attachment
            .events()
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            if let SessionEvent::Exited(code) = event {
                assert_eq!(code, Some(0));
                saw_exit = true;
                break;
            }
        }
        assert!(saw_exit, "subscriber should observe the exit event");
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[test]
    fn attach_to_exited_session_sees_exit_immediately() {
        let session = spawn("exit 7");
        assert_eq!(
            session.wait_for_exit_timeout(Duration::from_secs(10)),
            Some(Some(7))
        );
        let attachment = session.attach(true).expect("attach");
        let event = attachment
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("event");
        assert_eq!(event, SessionEvent::Exited(Some(7)));
    }

    #[test]
    fn primary_slot_is_exclusive() {
        let session = spawn("sleep 30");
        let first = session.attach(true).expect("primary attach");
        assert!(matches!(
            session.attach(true),
            Err(Error::AlreadyAttached(_))
        ));
        let second = session.attach(false).expect("non-primary attach");
        // Releasing the primary slot frees it for the next attach.
        session.detach(first.subscriber_id());
        let third = session.attach(true).expect("primary re-attach");
        drop(second);
        drop(third);
        session.kill(true);
    }

    #[test]
    fn input_and_resize_fail_after_exit() {
        let session = spawn("exit 0");
        session.wait_for_exit_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(
            session.send_input(b"x"),
            Err(Error::SessionNotRunning(_))
        ));
        assert!(matches!(
            session.resize(100, 40),
            Err(Error::SessionNotRunning(_))
        ));
    }

    #[test]
    fn resize_updates_size_and_notifies_subscribers() {
        let session = spawn("sleep 30");
        let attachment = session.attach(true).expect("attach");
        session.resize(100, 40).expect("resize");
        assert_eq!(session.size(), (100, 40));
        // The repaint replay lands on the subscriber channel.
        let event = attachment
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("replay event");
        assert!(matches!(event, SessionEvent::Output(_)));
        session.kill(true);
    }

    #[test]
    fn slow_subscriber_is_dropped_not_blocking() {
        let session = Session::spawn(
            format!("test-{}", Uuid::new_v4()),
            shell("seq 1 20000; exec sleep 30"),
            2, // tiny channel so the un-drained subscriber overflows
            DEFAULT_RING_CAPACITY,
        )
        .expect("spawn");
        let attachment = session.attach(true).expect("attach");
        let events = attachment.into_events();
        // Never drain; the session must keep running and eventually drop us.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut disconnected = false;
        let mut received = 0;
        while Instant::now() < deadline {
            match events.try_recv() {
                Ok(SessionEvent::Output(_)) => {
                    // Leave the channel full; only observe disconnection.
                    if received == 0 {
                        received += 1;
                        std::thread::sleep(Duration::from_millis(200));
                    } else {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
                Ok(SessionEvent::Exited(_)) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
        assert!(disconnected, "overflowing subscriber should be dropped");
        assert_eq!(session.state(), SessionState::Running);
        session.kill(true);
    }
}
