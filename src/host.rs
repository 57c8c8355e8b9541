use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pty::ring::DEFAULT_RING_CAPACITY;
use crate::pty::session::{Session, SessionInfo, SessionState};
use crate::pty::SpawnOptions;

/// Host tuning knobs. The defaults suit an interactive daemon; tests dial
/// the timers down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Exited sessions are retained this long before the reaper removes
    /// them (they stay listable with their exit code in the meantime).
    pub reap_grace_secs: u64,
    /// Reaper tick interval.
    pub tick_millis: u64,
    /// Per-subscriber event channel bound; an attached client that falls
    /// this far behind is dropped as a slow consumer.
    pub subscriber_capacity: usize,
    /// Output ring capacity in bytes.
    pub ring_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            reap_grace_secs: 600,
            tick_millis: 1000,
            subscriber_capacity: 64,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// Owns the id → session map. An ordinary value: multiple hosts coexist
/// (one per listener, or several in tests).
///
/// A background reaper removes Exited sessions after the grace period and
/// kills Running sessions whose idle deadline has elapsed.
pub struct SessionHost {
    config: HostConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionHost {
    pub fn new() -> Arc<Self> {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Arc<Self> {
        let tick = Duration::from_millis(config.tick_millis.max(10));
        let host = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        });
        spawn_reaper(Arc::downgrade(&host), tick);
        host
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Create a session. The id must be unique among live sessions; an
    /// Exited-but-unreaped session with the same id is replaced.
    pub fn create(&self, id: &str, options: SpawnOptions) -> Result<SessionInfo> {
        if id.is_empty() {
            return Err(Error::Protocol("session id must be non-empty".into()));
        }
        self.check_unique(id)?;

        // Spawn outside the map lock so lookups never wait on process
        // startup; recheck on insert to keep ids unique under races.
        let session = Session::spawn(
            id.to_string(),
            options,
            self.config.subscriber_capacity,
            self.config.ring_capacity,
        )?;

        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            if existing.state() != SessionState::Exited {
                drop(sessions);
                session.kill(true);
                return Err(Error::SessionAlreadyExists(id.to_string()));
            }
        }
        let descriptor = session.descriptor();
        sessions.insert(id.to_string(), session);
        Ok(descriptor)
    }

    fn check_unique(&self, id: &str) -> Result<()> {
        let sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(existing) if existing.state() != SessionState::Exited => {
                Err(Error::SessionAlreadyExists(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Descriptor snapshot of every live session, stably ordered by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .map(|s| s.descriptor())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Kill a session. Returns true iff it existed; unknown ids are not an
    /// error (idempotent kill).
    pub fn kill(&self, id: &str, force: bool) -> bool {
        match self.get(id) {
            Some(session) => {
                session.kill(force);
                true
            }
            None => false,
        }
    }

    /// Remove a session from the map immediately, killing it if needed.
    pub fn remove(&self, id: &str) -> bool {
        let session = self.sessions.lock().remove(id);
        match session {
            Some(session) => {
                if session.state() != SessionState::Exited {
                    session.kill(true);
                }
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn sweep(&self, now: Instant) {
        let idle: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.idle_expired(now))
            .cloned()
            .collect();
        for session in idle {
            tracing::info!(session = %session.id(), "idle timeout elapsed");
            session.kill(false);
        }

        let grace = Duration::from_secs(self.config.reap_grace_secs);
        let reapable: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.reapable(grace, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in reapable {
            self.sessions.lock().remove(&id);
            tracing::info!(session = %id, "reaped exited session");
        }
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.kill(true);
        }
    }
}

fn spawn_reaper(host: Weak<SessionHost>, tick: Duration) {
    std::thread::Builder::new()
        .name("session-reaper".into())
        .spawn(move || loop {
            std::thread::sleep(tick);
            match host.upgrade() {
                Some(host) => host.sweep(Instant::now()),
                None => break,
            }
        })
        .expect("failed to spawn reaper thread");
}
