//! PTY-backed sessions (restricted shell, agent CLIs).
//!
//! The child owns its own line discipline; this side is a byte pipe. Output is
//! read from the master, fed to the session's [`Tap`] and forwarded as UTF-8
//! `data` events. Exit is reported once, from the child's wait status.

use std::os::fd::{AsFd as _, AsRawFd as _, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::fcntl::{FcntlArg, FdFlag};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt as _;
use tokio::sync::mpsc;

use crate::error::SpawnError;
use crate::recording::Tap;
use crate::session::{EventSink, exit_parts};
use crate::utf8::Utf8Decoder;

const IO_BUFFER_SIZE: usize = 4096;
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Once the child is gone, keep draining until the master is quiet this long.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Everything needed to start a process on a fresh PTY.
#[derive(Debug, Clone)]
pub struct PtySpawn {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    /// Kill the session after this long without output.
    pub idle_timeout: Option<Duration>,
}

pub struct PtyHandle {
    master: Arc<OwnedFd>,
    pgid: Pid,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    exited: Arc<AtomicBool>,
    killed: AtomicBool,
}

fn set_window_size_raw(fd: i32, rows: u16, cols: u16) -> std::io::Result<()> {
    let ws = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCSWINSZ, &ws) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Open a PTY pair with both ends close-on-exec, so no concurrently spawned child inherits them.
fn open_pty(rows: u16, cols: u16) -> Result<nix::pty::OpenptyResult, SpawnError> {
    let ws = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = nix::pty::openpty(Some(&ws), None).map_err(SpawnError::PtyUnavailable)?;
    for fd in [&pty.master, &pty.slave] {
        nix::fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(SpawnError::PtyUnavailable)?;
    }
    Ok(pty)
}

fn signal_group(pgid: Pid, signal: Signal) {
    if let Err(e) = nix::sys::signal::killpg(pgid, signal) {
        tracing::debug!("killpg({pgid}, {signal}) failed: {e}");
    }
}

impl PtyHandle {
    /// Open a PTY and start `launch.program` as a session leader on it.
    pub fn spawn(launch: PtySpawn, sink: EventSink, tap: Tap) -> Result<Self, SpawnError> {
        let program = launch.program.display().to_string();
        let spawn_err = |source: std::io::Error| SpawnError::Spawn {
            program: program.clone(),
            source,
        };

        let nix::pty::OpenptyResult { master, slave } = open_pty(launch.rows, launch.cols)?;

        let mut cmd = tokio::process::Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&launch.cwd)
            .env("TERM", "xterm-256color")
            .env("COLUMNS", launch.cols.to_string())
            .env("LINES", launch.rows.to_string())
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(slave.try_clone().map_err(spawn_err)?))
            .stdout(Stdio::from(slave.try_clone().map_err(spawn_err)?))
            .stderr(Stdio::from(slave));

        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                // Set controlling terminal
                if nix::libc::ioctl(nix::libc::STDIN_FILENO, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        // Close our copies of the slave so the master sees EOF when the child goes away.
        drop(cmd);

        let pid = child
            .id()
            .ok_or_else(|| spawn_err(std::io::Error::other("child exited before it was tracked")))?;
        let pgid = Pid::from_raw(pid as i32);

        let reader = tokio::fs::File::from_std(std::fs::File::from(
            master.try_clone().map_err(spawn_err)?,
        ));
        let master = Arc::new(master);
        let exited = Arc::new(AtomicBool::new(false));

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_fd = Arc::clone(&master);
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = write_all(&writer_fd, &data) {
                    tracing::debug!("pty write failed: {e}");
                    break;
                }
            }
        });

        tracing::info!(
            session_id = sink.session_id(),
            pid,
            program = %launch.program.display(),
            "pty session started"
        );

        tokio::spawn(pump(
            reader,
            child,
            sink,
            tap,
            launch.idle_timeout,
            Arc::clone(&exited),
            pgid,
        ));

        Ok(Self {
            master,
            pgid,
            input_tx,
            exited,
            killed: AtomicBool::new(false),
        })
    }

    /// Queue raw bytes for the child. Never blocks on the child consuming them.
    pub fn write(&self, data: &[u8]) -> bool {
        !self.exited.load(Ordering::Acquire) && self.input_tx.send(data.to_vec()).is_ok()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        set_window_size_raw(self.master.as_raw_fd(), rows, cols)
    }

    /// SIGHUP the process group, escalating to SIGKILL if it outlives the grace period.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) || self.exited.load(Ordering::Acquire) {
            return;
        }
        signal_group(self.pgid, Signal::SIGHUP);

        let pgid = self.pgid;
        let exited = Arc::clone(&self.exited);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(KILL_GRACE).await;
                    if !exited.load(Ordering::Acquire) {
                        signal_group(pgid, Signal::SIGKILL);
                    }
                });
            }
            Err(_) => signal_group(pgid, Signal::SIGKILL),
        }
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

fn write_all(fd: &OwnedFd, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        match nix::unistd::write(fd.as_fd(), data) {
            Ok(n) => data = &data[n..],
            Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn pump(
    mut reader: tokio::fs::File,
    mut child: tokio::process::Child,
    sink: EventSink,
    tap: Tap,
    mut idle_timeout: Option<Duration>,
    exited: Arc<AtomicBool>,
    pgid: Pid,
) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();
    let mut status: Option<std::io::Result<std::process::ExitStatus>> = None;
    let mut idle_killed = false;

    loop {
        let timer = if status.is_some() {
            Some(EXIT_DRAIN)
        } else {
            idle_timeout
        };

        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    tap.feed(&buf[..n]);
                    sink.data(decoder.decode(&buf[..n]));
                }
                // Linux reports EIO once the last slave fd closes.
                Err(e) => {
                    tracing::debug!("pty read ended: {e}");
                    break;
                }
            },
            result = child.wait(), if status.is_none() => {
                status = Some(result);
            }
            () = sleep_or_pending(timer) => {
                if status.is_some() {
                    break;
                }
                tracing::warn!(session_id = sink.session_id(), "pty session idle, killing");
                signal_group(pgid, Signal::SIGKILL);
                idle_timeout = None;
                idle_killed = true;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        sink.data(tail);
    }

    let status = match status {
        Some(status) => status,
        None => child.wait().await,
    };
    exited.store(true, Ordering::Release);

    if idle_killed {
        let notice = "\r\n[session killed after inactivity]\r\n";
        tap.feed(notice.as_bytes());
        sink.data(notice);
    }

    let (code, signal) = match status {
        Ok(status) => exit_parts(status),
        Err(e) => {
            tracing::warn!("failed to wait for pty child: {e}");
            (None, None)
        }
    };
    tracing::info!(session_id = sink.session_id(), ?code, ?signal, "pty session exited");
    sink.exit(code, signal, true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_fds_are_close_on_exec() {
        let Ok(pty) = open_pty(24, 80) else {
            eprintln!("no pty on this host, skipping");
            return;
        };
        for fd in [&pty.master, &pty.slave] {
            let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }
}
