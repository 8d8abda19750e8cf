//! Session events and the per-connection session registry.

use std::collections::HashMap;
use std::path::PathBuf;

use relay_protocol::BackendKind;
use tokio::sync::mpsc;

use crate::error::RequestError;
use crate::exec::ExecHandle;
use crate::pty::PtyHandle;

/// Output and exit notifications produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data {
        session_id: String,
        data: String,
    },
    Exit {
        session_id: String,
        code: Option<i32>,
        signal: Option<String>,
        /// True when the session itself is gone (PTY exit), false for a finished exec command.
        terminal: bool,
    },
}

impl SessionEvent {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Data { session_id, .. } | SessionEvent::Exit { session_id, .. } => {
                session_id
            }
        }
    }
}

/// A session's handle on the dispatcher's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    #[must_use]
    pub fn new(session_id: String, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session_id, tx }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn data(&self, data: impl Into<String>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(SessionEvent::Data {
            session_id: self.session_id.clone(),
            data,
        });
    }

    pub fn exit(&self, code: Option<i32>, signal: Option<String>, terminal: bool) {
        let _ = self.tx.send(SessionEvent::Exit {
            session_id: self.session_id.clone(),
            code,
            signal,
            terminal,
        });
    }
}

/// Decode an exit status into `(code, signal name)`.
#[must_use]
pub fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt as _;

    let signal = status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("SIG{sig}"))
    });
    (status.code(), signal)
}

/// Backend process behind a session.
pub enum Handle {
    Pty(PtyHandle),
    Exec(ExecHandle),
}

impl Handle {
    /// Queue input. Returns false once the backend can no longer take input.
    pub fn write(&mut self, data: &[u8]) -> bool {
        match self {
            Handle::Pty(pty) => pty.write(data),
            Handle::Exec(exec) => exec.write(data),
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        match self {
            Handle::Pty(pty) => {
                if let Err(e) = pty.resize(cols, rows) {
                    tracing::debug!("pty resize failed: {e}");
                }
            }
            // No terminal to inform; dimensions are only bookkeeping.
            Handle::Exec(_) => {}
        }
    }

    /// Signal used for the synthetic exit reported after `close`.
    pub fn kill(&self) -> Option<&'static str> {
        match self {
            Handle::Pty(pty) => {
                pty.kill();
                Some("SIGHUP")
            }
            Handle::Exec(exec) => {
                exec.kill();
                None
            }
        }
    }
}

pub struct SessionEntry {
    pub kind: BackendKind,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub handle: Handle,
}

/// Sessions opened on one connection. Owned by the connection's dispatch task.
pub struct SessionRegistry {
    sessions: HashMap<String, SessionEntry>,
    max_sessions: usize,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Checked before spawning so a refused open never starts a process.
    pub fn ensure_capacity(&self) -> Result<(), RequestError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(RequestError::QuotaExceeded(self.sessions.len()));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn insert(&mut self, id: String, entry: SessionEntry) {
        self.sessions.insert(id, entry);
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        self.sessions.remove(id)
    }

    pub fn drain(&mut self) -> Vec<(String, SessionEntry)> {
        self.sessions.drain().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_skips_empty_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("exec-a".to_string(), tx);
        sink.data("");
        sink.data("hi");
        sink.exit(Some(0), None, false);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Data {
                session_id: "exec-a".to_string(),
                data: "hi".to_string()
            }
        );
        let exit = rx.try_recv().unwrap();
        assert_eq!(exit.session_id(), "exec-a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_quota_check() {
        let registry = SessionRegistry::new(0);
        assert!(matches!(
            registry.ensure_capacity(),
            Err(RequestError::QuotaExceeded(0))
        ));
        assert!(SessionRegistry::new(1).ensure_capacity().is_ok());
    }

    #[test]
    fn test_exit_parts_for_signal() {
        use std::os::unix::process::ExitStatusExt as _;
        let (code, signal) = exit_parts(std::process::ExitStatus::from_raw(9));
        assert_eq!(code, None);
        assert_eq!(signal.as_deref(), Some("SIGKILL"));
        let (code, signal) = exit_parts(std::process::ExitStatus::from_raw(3 << 8));
        assert_eq!(code, Some(3));
        assert_eq!(signal, None);
    }
}
