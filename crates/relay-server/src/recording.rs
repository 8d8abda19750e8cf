//! Durable per-session recordings and emulator-backed snapshots.
//!
//! Every session gets a [`Tap`]: a FIFO feeding one task that appends output to
//! `<dir>/<session>.log` and, for PTY sessions, runs the same bytes through a
//! [`Screen`]. Snapshots go through the same queue so they observe every byte
//! fed before them. Failures on this path are logged and swallowed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use relay_protocol::{Snapshot, SnapshotSource};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::{mpsc, oneshot};

use crate::error::RecordingError;
use crate::screen::Screen;

const LOG_EXTENSION: &str = "log";

enum TapOp {
    Feed(Bytes),
    Resize { rows: u16, cols: u16 },
    Flush(oneshot::Sender<TapState>),
}

/// What a tap looks like once every queued write has been applied.
#[derive(Debug, Clone)]
pub struct TapState {
    pub rows: u16,
    pub cols: u16,
    /// Rendered screen; `None` for sessions without an emulator.
    pub screen: Option<String>,
}

/// Write side of one session's recording.
#[derive(Clone)]
pub struct Tap {
    tx: mpsc::UnboundedSender<TapOp>,
}

impl Tap {
    pub fn feed(&self, data: &[u8]) {
        let _ = self.tx.send(TapOp::Feed(Bytes::copy_from_slice(data)));
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        let _ = self.tx.send(TapOp::Resize { rows, cols });
    }

    /// Wait until every previously fed chunk has been written and emulated.
    pub async fn flush(&self) -> Option<TapState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(TapOp::Flush(reply_tx)).ok()?;
        reply_rx.await.ok()
    }
}

pub struct Recorder {
    dir: PathBuf,
    tail_bytes: usize,
    retention: Duration,
    default_size: (u16, u16),
    taps: parking_lot::Mutex<HashMap<String, Tap>>,
}

impl Recorder {
    #[must_use]
    pub fn new(dir: PathBuf, tail_bytes: usize, retention: Duration) -> Self {
        Self {
            dir,
            tail_bytes,
            retention,
            default_size: (24, 80),
            taps: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &relay_config::Config) -> Self {
        let dir = config
            .recording
            .dir
            .clone()
            .unwrap_or_else(relay_protocol::recordings_dir);
        let mut recorder = Self::new(
            dir,
            config.recording.tail_bytes,
            Duration::from_secs(config.recording.retention_secs),
        );
        recorder.default_size = (config.sessions.default_rows, config.sessions.default_cols);
        recorder
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session ids come from URLs too; only plain names map to files.
    fn log_path(&self, session_id: &str) -> Option<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{session_id}.{LOG_EXTENSION}")))
    }

    /// Start recording a session. PTY sessions also get an emulator.
    pub fn open(&self, session_id: &str, pty: bool, rows: u16, cols: u16) -> Tap {
        let (tx, rx) = mpsc::unbounded_channel();
        let screen = pty.then(|| Screen::new(rows, cols));
        tokio::spawn(run_tap(self.log_path(session_id), rx, screen, (rows, cols)));

        let tap = Tap { tx };
        self.taps.lock().insert(session_id.to_string(), tap.clone());
        tracing::debug!(session_id, pty, "recording started");
        tap
    }

    /// Drop the live tap (and its emulator). The log stays until swept.
    pub fn release(&self, session_id: &str) {
        if self.taps.lock().remove(session_id).is_some() {
            tracing::debug!(session_id, "recording released");
        }
    }

    #[must_use]
    pub fn is_live(&self, session_id: &str) -> bool {
        self.taps.lock().contains_key(session_id)
    }

    /// Live tap of a session that is still open.
    pub fn tap(&self, session_id: &str) -> Option<Tap> {
        self.taps.lock().get(session_id).cloned()
    }

    /// Current screen of a PTY session, or the log tail when no emulator exists.
    pub async fn snapshot(
        &self,
        session_id: &str,
        tail_bytes: Option<usize>,
    ) -> Result<Snapshot, RecordingError> {
        let state = match self.tap(session_id) {
            Some(tap) => tap.flush().await,
            None => None,
        };

        if let Some(TapState {
            rows,
            cols,
            screen: Some(data),
        }) = state
        {
            return Ok(Snapshot {
                cols,
                rows,
                data,
                source: SnapshotSource::Emulator,
            });
        }

        let (rows, cols) = state.map_or(self.default_size, |s| (s.rows, s.cols));
        let data = self.read_log_tail(session_id, tail_bytes).await?;
        Ok(Snapshot {
            cols,
            rows,
            data,
            source: SnapshotSource::Log,
        })
    }

    /// Raw tail of a session's log.
    pub async fn replay(
        &self,
        session_id: &str,
        tail_bytes: Option<usize>,
    ) -> Result<String, RecordingError> {
        if let Some(tap) = self.tap(session_id) {
            tap.flush().await;
        }
        self.read_log_tail(session_id, tail_bytes).await
    }

    async fn read_log_tail(
        &self,
        session_id: &str,
        tail_bytes: Option<usize>,
    ) -> Result<String, RecordingError> {
        let path = self
            .log_path(session_id)
            .ok_or_else(|| RecordingError::NotFound(session_id.to_string()))?;
        let limit = tail_bytes.unwrap_or(self.tail_bytes);
        match read_tail(&path, limit).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RecordingError::NotFound(session_id.to_string()))
            }
            Err(e) => Err(RecordingError::Io(e)),
        }
    }

    /// Delete logs of released sessions older than the retention window.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.is_live(stem) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= self.retention {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("failed to remove {}: {e}", path.display()),
                }
            }
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match recorder.sweep().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("swept {n} expired recordings"),
                    Err(e) => tracing::warn!("recording sweep failed: {e}"),
                }
            }
        })
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn run_tap(
    path: Option<PathBuf>,
    mut rx: mpsc::UnboundedReceiver<TapOp>,
    mut screen: Option<Screen>,
    mut size: (u16, u16),
) {
    let mut log: Option<tokio::fs::File> = None;
    // Stop retrying after the first failure; output forwarding is unaffected.
    let mut log_broken = path.is_none();

    while let Some(op) = rx.recv().await {
        match op {
            TapOp::Feed(data) => {
                if !log_broken && log.is_none() {
                    if let Some(path) = &path {
                        match open_log(path).await {
                            Ok(file) => log = Some(file),
                            Err(e) => {
                                tracing::warn!("failed to open recording {}: {e}", path.display());
                                log_broken = true;
                            }
                        }
                    }
                }
                if let Some(file) = log.as_mut()
                    && let Err(e) = file.write_all(&data).await
                {
                    tracing::warn!("recording write failed: {e}");
                    log = None;
                    log_broken = true;
                }
                if let Some(screen) = screen.as_mut() {
                    screen.push(&data);
                }
            }
            TapOp::Resize { rows, cols } => {
                size = (rows, cols);
                if let Some(screen) = screen.as_mut() {
                    screen.resize(rows, cols);
                }
            }
            TapOp::Flush(reply) => {
                if let Some(file) = log.as_mut()
                    && let Err(e) = file.flush().await
                {
                    tracing::warn!("recording flush failed: {e}");
                }
                let _ = reply.send(TapState {
                    rows: size.0,
                    cols: size.1,
                    screen: screen.as_ref().map(Screen::render),
                });
            }
        }
    }

    if let Some(mut file) = log {
        let _ = file.flush().await;
    }
}

async fn read_tail(path: &Path, limit: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(limit as u64);
    file.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    // Don't start mid-character.
    let skip = if start > 0 {
        buf.iter().take_while(|b| (**b & 0xC0) == 0x80).count()
    } else {
        0
    };
    Ok(String::from_utf8_lossy(&buf[skip..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(dir: &Path) -> Recorder {
        Recorder::new(dir.to_path_buf(), 1024, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_snapshot_uses_emulator_not_scrollback() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let tap = recorder.open("pty-one", true, 24, 80);

        for i in 0..30 {
            tap.feed(format!("old output {i}\r\n").as_bytes());
        }
        tap.feed(b"\x1b[2J\x1b[H");
        tap.feed(b"X");

        let snapshot = recorder.snapshot("pty-one", None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Emulator);
        assert_eq!(snapshot.data, "X");
        assert_eq!((snapshot.cols, snapshot.rows), (80, 24));

        // The log still has everything.
        let replay = recorder.replay("pty-one", Some(100_000)).await.unwrap();
        assert!(replay.contains("old output 0"));
        assert!(replay.ends_with("X"));
    }

    #[tokio::test]
    async fn test_exec_session_falls_back_to_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let tap = recorder.open("exec-one", false, 30, 100);
        tap.feed(b"first\r\n");
        tap.feed(b"second\r\n");

        let snapshot = recorder.snapshot("exec-one", Some(8)).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Log);
        assert_eq!(snapshot.data, "second\r\n");
        assert_eq!((snapshot.cols, snapshot.rows), (100, 30));
    }

    #[tokio::test]
    async fn test_released_session_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let tap = recorder.open("pty-two", true, 24, 80);
        tap.feed(b"still here");
        tap.flush().await;
        drop(tap);
        recorder.release("pty-two");

        assert!(!recorder.is_live("pty-two"));
        let snapshot = recorder.snapshot("pty-two", None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Log);
        assert_eq!(snapshot.data, "still here");
    }

    #[tokio::test]
    async fn test_unknown_and_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        assert!(matches!(
            recorder.snapshot("nope", None).await,
            Err(RecordingError::NotFound(_))
        ));
        assert!(matches!(
            recorder.replay("../../etc/passwd", None).await,
            Err(RecordingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_reaches_emulator() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let tap = recorder.open("pty-three", true, 24, 80);
        tap.resize(10, 20);
        let state = tap.flush().await.unwrap();
        assert_eq!((state.rows, state.cols), (10, 20));
    }

    #[tokio::test]
    async fn test_sweep_skips_live_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf(), 1024, Duration::ZERO);

        let live = recorder.open("live", true, 24, 80);
        live.feed(b"a");
        live.flush().await;

        let gone = recorder.open("gone", false, 24, 80);
        gone.feed(b"b");
        gone.flush().await;
        recorder.release("gone");

        let removed = recorder.sweep().await.unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("live.log").exists());
        assert!(!dir.path().join("gone.log").exists());
    }

    #[tokio::test]
    async fn test_tail_does_not_split_characters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        std::fs::write(&path, "aé✓").unwrap();
        // Last 3 bytes are exactly the check mark; 4 lands inside é.
        assert_eq!(read_tail(&path, 3).await.unwrap(), "✓");
        assert_eq!(read_tail(&path, 4).await.unwrap(), "✓");
    }
}
