pub mod reader;
pub mod ring;
pub mod session;

pub use session::{Session, SessionEvent, SessionInfo, SessionState};

use std::collections::HashMap;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options for spawning a session's PTY child. This is also the wire shape
/// used by `CreateRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Absolute or PATH-resolved executable.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; the spawning user's home when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Kill the session after this long without input or output; absent
    /// means never.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cols: default_cols(),
            rows: default_rows(),
            idle_timeout_secs: None,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Result of opening a PTY and spawning the child into it.
pub(crate) struct SpawnedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn std::io::Read + Send>,
    pub writer: Box<dyn std::io::Write + Send>,
}

/// Open a PTY pair and spawn the configured child on its slave side.
pub(crate) fn spawn_pty(options: &SpawnOptions) -> Result<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: options.rows.max(1),
            cols: options.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&options.command);
    cmd.args(&options.args);

    if let Some(dir) = &options.cwd {
        cmd.cwd(dir);
    } else if let Some(home) = dirs::home_dir() {
        cmd.cwd(home);
    }

    // Children see a modern 256/truecolor terminal.
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (key, value) in &options.env {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;

    Ok(SpawnedPty {
        master: pair.master,
        child,
        reader,
        writer,
    })
}
