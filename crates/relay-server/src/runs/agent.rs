//! Child process side of a run: spawn, classify output lines, report the result.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use relay_protocol::RunEvent;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio_util::sync::CancellationToken;

use super::RunWriter;
use crate::error::SpawnError;
use crate::session::exit_parts;

const STOP_GRACE: Duration = Duration::from_secs(3);
const READ_CHUNK: usize = 8192;
/// A line with no newline after this many bytes is flushed as it stands.
const MAX_LINE: usize = 1 << 20;

/// Splits a child pipe into lines. Bytes that are not UTF-8 are replaced, never fatal.
struct LineReader<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Read once. `None` at end of stream, else the lines completed by this read (maybe none).
    async fn read_lines(&mut self) -> Option<Vec<String>> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) => return None,
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    return Some(self.take_lines());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("run pipe read failed: {e}");
                    return None;
                }
            }
        }
    }

    fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(end) = self.pending.iter().rposition(|b| *b == b'\n') {
            let rest = self.pending.split_off(end + 1);
            let complete = std::mem::replace(&mut self.pending, rest);
            lines.extend(
                complete[..end]
                    .split(|b| *b == b'\n')
                    .map(|line| String::from_utf8_lossy(line).into_owned()),
            );
        }
        if self.pending.len() >= MAX_LINE {
            let long = std::mem::take(&mut self.pending);
            lines.push(String::from_utf8_lossy(&long).into_owned());
        }
        lines
    }

    /// Whatever followed the last newline, once the stream has ended.
    fn remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.is_empty()).then(|| String::from_utf8_lossy(&rest).into_owned())
    }
}

pub fn spawn(program: &Path, args: &[String], cwd: &Path) -> Result<tokio::process::Child, SpawnError> {
    tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| SpawnError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

/// Buffer line for one line of agent stdout. JSON passes through untouched.
#[must_use]
pub fn stdout_line(line: &str) -> Option<String> {
    let trimmed = line.trim_end_matches('\r');
    if trimmed.trim().is_empty() {
        return None;
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }
    encode(&RunEvent::Text {
        text: trimmed.to_string(),
    })
}

#[must_use]
pub fn stderr_line(line: &str) -> Option<String> {
    let trimmed = line.trim_end_matches('\r');
    if trimmed.trim().is_empty() {
        return None;
    }
    encode(&RunEvent::Stderr {
        text: trimmed.to_string(),
    })
}

fn encode(event: &RunEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

fn signal_group(pgid: Option<Pid>, signal: Signal) {
    if let Some(pgid) = pgid
        && let Err(e) = nix::sys::signal::killpg(pgid, signal)
    {
        tracing::debug!("killpg({pgid}, {signal}) failed: {e}");
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive a run to completion. The `result` line is appended only after the child has exited.
pub async fn pump(
    run_id: String,
    mut child: tokio::process::Child,
    mut writer: RunWriter,
    stop: CancellationToken,
    idle_timeout: Duration,
) {
    let started = Instant::now();
    let run_id = run_id.as_str();
    let pgid = child.id().map(|id| Pid::from_raw(id as i32));

    let mut stdout = child.stdout.take().map(LineReader::new);
    let mut stderr = child.stderr.take().map(LineReader::new);

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let mut status = None;
    let mut timed_out = false;
    let mut stopped = false;
    let mut kill_at: Option<tokio::time::Instant> = None;

    while status.is_none() || stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = async { stdout.as_mut()?.read_lines().await }, if stdout.is_some() => {
                let ended = read.is_none();
                let mut lines = read.unwrap_or_default();
                if ended {
                    lines.extend(stdout.take().and_then(|mut r| r.remainder()));
                }
                for line in lines.iter().filter_map(|l| stdout_line(l)) {
                    writer.append(&line).await;
                }
                // Any output counts as activity, whole lines or not.
                if !ended {
                    idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                }
            }
            read = async { stderr.as_mut()?.read_lines().await }, if stderr.is_some() => {
                let ended = read.is_none();
                let mut lines = read.unwrap_or_default();
                if ended {
                    lines.extend(stderr.take().and_then(|mut r| r.remainder()));
                }
                for line in lines.iter().filter_map(|l| stderr_line(l)) {
                    writer.append(&line).await;
                }
                if !ended {
                    idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                }
            }
            result = child.wait(), if status.is_none() => {
                status = Some(result);
            }
            () = &mut idle, if !timed_out => {
                tracing::warn!(run_id, "run idle for {idle_timeout:?}, killing");
                timed_out = true;
                signal_group(pgid, Signal::SIGKILL);
            }
            () = stop.cancelled(), if !stopped => {
                tracing::info!(run_id, "stopping run");
                stopped = true;
                signal_group(pgid, Signal::SIGTERM);
                kill_at = Some(tokio::time::Instant::now() + STOP_GRACE);
            }
            () = sleep_until_opt(kill_at) => {
                kill_at = None;
                signal_group(pgid, Signal::SIGKILL);
            }
        }
    }

    let (exit_code, signal) = match status {
        Some(Ok(status)) => exit_parts(status),
        Some(Err(e)) => {
            tracing::warn!(run_id, "failed to wait for run child: {e}");
            (None, None)
        }
        None => (None, None),
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let result = RunEvent::Result {
        exit_code,
        signal,
        timed_out,
        stopped,
        duration_ms,
    };
    if let Some(line) = encode(&result) {
        writer.append(&line).await;
    }
    writer.finish().await;
    tracing::info!(run_id, ?exit_code, timed_out, stopped, duration_ms, "run finished");
}
