//! Run buffers kept as `<dir>/<run_id>.jsonl`, readable after the process is forgotten.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt as _;
use relay_protocol::{RunEvent, RunOutput};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use super::{ActiveRuns, LineStream};
use crate::error::RunError;

const EXTENSION: &str = "jsonl";
/// How far back to look for the last complete line when nothing new is readable.
const TAIL_WINDOW: u64 = 64 * 1024;

pub struct FileRuns {
    dir: PathBuf,
}

/// Appends lines to one run file.
pub struct FileWriter {
    file: tokio::fs::File,
}

impl FileWriter {
    pub async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        // One write per line so readers never see a line without its newline for long.
        self.file.write_all(&chunk).await?;
        self.file.flush().await
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

impl FileRuns {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, run_id: &str) -> Option<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        valid.then(|| self.dir.join(format!("{run_id}.{EXTENSION}")))
    }

    pub async fn create(&self, run_id: &str) -> Result<FileWriter, RunError> {
        let path = self
            .path(run_id)
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(FileWriter { file })
    }

    pub async fn exists(&self, run_id: &str) -> bool {
        match self.path(run_id) {
            Some(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Complete lines from `offset`. `running` is whether a handle for the run is still live.
    pub async fn read(
        &self,
        run_id: &str,
        offset: u64,
        running: bool,
    ) -> Result<RunOutput, RunError> {
        let path = self
            .path(run_id)
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunError::UnknownRun(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        let start = offset.min(len);
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf).await?;

        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        buf.truncate(complete);
        let next_offset = start + complete as u64;

        let ended = !running
            && match last_line(&buf) {
                Some(line) => RunEvent::is_result_line(line),
                None => {
                    let line = last_line_before(&mut file, next_offset).await?;
                    line.as_deref().is_some_and(RunEvent::is_result_line)
                }
            };

        Ok(RunOutput {
            output: String::from_utf8_lossy(&buf).into_owned(),
            next_offset,
            ended,
        })
    }

    /// Replay from the start, then poll for new lines until the run has ended.
    pub fn follow(
        self: &Arc<Self>,
        run_id: &str,
        poll: Duration,
        active: ActiveRuns,
    ) -> LineStream {
        struct Follow {
            runs: Arc<FileRuns>,
            run_id: String,
            offset: u64,
            poll: Duration,
            active: ActiveRuns,
            done: bool,
        }

        let state = Follow {
            runs: Arc::clone(self),
            run_id: run_id.to_string(),
            offset: 0,
            poll,
            active,
            done: false,
        };

        futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                let running = state.active.lock().contains_key(&state.run_id);
                let out = match state.runs.read(&state.run_id, state.offset, running).await {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::debug!(run_id = %state.run_id, "run follow stopped: {e}");
                        return None;
                    }
                };
                state.offset = out.next_offset;
                state.done = out.ended;
                if !out.output.is_empty() {
                    return Some((Bytes::from(out.output), state));
                }
                if !state.done {
                    tokio::time::sleep(state.poll).await;
                }
            }
        })
        .boxed()
    }

    /// Remove run files untouched for `retention`, skipping runs still in progress.
    pub async fn sweep(&self, retention: Duration, active: &ActiveRuns) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if active.lock().contains_key(run_id) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if now.duration_since(modified).unwrap_or_default() >= retention {
                remove(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!("failed to remove {}: {e}", path.display());
    }
}

/// Last line of a buffer that ends in a newline.
fn last_line(buf: &[u8]) -> Option<&str> {
    let body = buf.strip_suffix(b"\n")?;
    let start = body.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    std::str::from_utf8(&body[start..]).ok()
}

async fn last_line_before(
    file: &mut tokio::fs::File,
    end: u64,
) -> std::io::Result<Option<String>> {
    if end == 0 {
        return Ok(None);
    }
    let start = end.saturating_sub(TAIL_WINDOW);
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(last_line(&buf).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULT: &str = r#"{"type":"result","exitCode":0,"signal":null,"timedOut":false,"stopped":false,"durationMs":5}"#;

    #[tokio::test]
    async fn test_partial_lines_are_withheld() {
        let dir = tempfile::tempdir().unwrap();
        let runs = FileRuns::new(dir.path().to_path_buf());
        runs.create("r1").await.unwrap();
        std::fs::write(dir.path().join("r1.jsonl"), "{\"a\":1}\n{\"b\":").unwrap();

        let out = runs.read("r1", 0, true).await.unwrap();
        assert_eq!(out.output, "{\"a\":1}\n");
        assert_eq!(out.next_offset, 8);
        assert!(!out.ended);
    }

    #[tokio::test]
    async fn test_ended_needs_result_and_no_live_handle() {
        let dir = tempfile::tempdir().unwrap();
        let runs = FileRuns::new(dir.path().to_path_buf());
        let mut writer = runs.create("r2").await.unwrap();
        writer.append(r#"{"type":"text","text":"hi"}"#).await.unwrap();
        writer.append(RESULT).await.unwrap();
        writer.finish().await.unwrap();

        let still_running = runs.read("r2", 0, true).await.unwrap();
        assert!(!still_running.ended);

        let done = runs.read("r2", 0, false).await.unwrap();
        assert!(done.ended);
        assert!(done.output.ends_with(&format!("{RESULT}\n")));

        // Caught up: nothing new, still ended, same offset.
        let tail = runs.read("r2", done.next_offset, false).await.unwrap();
        assert_eq!(tail.output, "");
        assert_eq!(tail.next_offset, done.next_offset);
        assert!(tail.ended);
    }

    #[tokio::test]
    async fn test_agent_result_line_is_not_enough_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let runs = FileRuns::new(dir.path().to_path_buf());
        let mut writer = runs.create("r3").await.unwrap();
        // Agents emit their own `result` objects before we append ours.
        writer.append(r#"{"type":"result","subtype":"success"}"#).await.unwrap();
        assert!(!runs.read("r3", 0, true).await.unwrap().ended);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let runs = FileRuns::new(dir.path().to_path_buf());
        assert!(matches!(
            runs.read("missing", 0, false).await,
            Err(RunError::UnknownRun(_))
        ));
        assert!(matches!(
            runs.read("../etc/passwd", 0, false).await,
            Err(RunError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_stops_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(FileRuns::new(dir.path().to_path_buf()));
        let mut writer = runs.create("r4").await.unwrap();
        writer.append(r#"{"type":"text","text":"a"}"#).await.unwrap();
        writer.append(RESULT).await.unwrap();

        let active = ActiveRuns::default();
        let chunks: Vec<Bytes> = runs
            .follow("r4", Duration::from_millis(10), active)
            .collect()
            .await;
        let text: String = chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        assert!(text.starts_with(r#"{"type":"text","text":"a"}"#));
        assert!(text.ends_with(&format!("{RESULT}\n")));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line(b"a\nb\n"), Some("b"));
        assert_eq!(last_line(b"a\n"), Some("a"));
        assert_eq!(last_line(b""), None);
    }
}
