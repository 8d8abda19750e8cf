//! Error taxonomy shared by the dispatcher, backends and the HTTP surface.

use std::path::PathBuf;

/// Why a backend process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The host cannot allocate a pseudo-terminal. Restricted mode falls back to exec on this.
    #[error("pseudo-terminal facility unavailable: {0}")]
    PtyUnavailable(#[source] nix::Error),
    #[error("`{name}` was not found: {hint}")]
    BinaryNotFound { name: String, hint: String },
    #[error("{0}")]
    InvalidCommand(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CwdError {
    #[error("no session roots are configured")]
    NoRoots,
    #[error("{}: {source}", path.display())]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("{} is outside the permitted roots", .0.display())]
    OutsideRoots(PathBuf),
}

/// Failures reported on a `*.resp` with `ok: false`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid frame: {0}")]
    Malformed(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session limit reached ({0} open)")]
    QuotaExceeded(usize),
    #[error("invalid working directory: {0}")]
    Cwd(#[from] CwdError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("session {0} is no longer accepting input")]
    SessionGone(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("invalid working directory: {0}")]
    Cwd(#[from] CwdError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("run storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("no recording for session {0}")]
    NotFound(String),
    #[error("recording read failed: {0}")]
    Io(#[from] std::io::Error),
}
