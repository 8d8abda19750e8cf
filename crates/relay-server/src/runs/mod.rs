//! Non-interactive agent runs whose output outlives the request that started them.
//!
//! Output is an append-only buffer of NDJSON lines. Readers either poll it by
//! byte offset or attach a stream that replays the buffer and then follows it.
//! Two buffer strategies exist: in memory with live listeners, or one `.jsonl`
//! file per run that is polled.

mod agent;
mod file;
mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use relay_config::{Config, RunStrategy};
use relay_protocol::{RunEvent, RunOutput, RunStarted, StartRun, StopResponse};
use tokio_util::sync::CancellationToken;

pub use agent::{stderr_line, stdout_line};
pub use file::FileRuns;
pub use memory::{MemoryRun, MemoryRuns};

use crate::backend::{agent_config, resolve_binary, run_args};
use crate::error::{CwdError, RunError};
use crate::paths::{expand_home, validate_cwd};

/// NDJSON chunks, each holding one or more complete lines.
pub type LineStream = futures_util::stream::BoxStream<'static, Bytes>;

/// Stop tokens of runs whose process has not finished yet.
pub type ActiveRuns = Arc<parking_lot::Mutex<HashMap<String, CancellationToken>>>;

enum RunBuffer {
    Memory(MemoryRuns),
    File(Arc<FileRuns>),
}

/// Write side of a run buffer, owned by the run's pump task.
pub enum RunWriter {
    Memory(Arc<MemoryRun>),
    File(file::FileWriter),
}

impl RunWriter {
    pub async fn append(&mut self, line: &str) {
        match self {
            RunWriter::Memory(run) => run.append(line),
            RunWriter::File(writer) => {
                if let Err(e) = writer.append(line).await {
                    tracing::warn!("run file append failed: {e}");
                }
            }
        }
    }

    pub async fn finish(self) {
        match self {
            RunWriter::Memory(run) => run.end(),
            RunWriter::File(writer) => {
                if let Err(e) = writer.finish().await {
                    tracing::warn!("run file flush failed: {e}");
                }
            }
        }
    }
}

/// A freshly started run, with the initiating request's stream when it asked for one.
pub struct StartedRun {
    pub started: RunStarted,
    pub stream: Option<LineStream>,
}

pub struct RunManager {
    config: Arc<Config>,
    roots: Arc<[PathBuf]>,
    buffer: RunBuffer,
    active: ActiveRuns,
}

impl RunManager {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let roots: Arc<[PathBuf]> = config.sessions.effective_roots().into();
        let buffer = match config.runs.strategy {
            RunStrategy::Memory => RunBuffer::Memory(MemoryRuns::default()),
            RunStrategy::File => {
                let dir = config
                    .runs
                    .dir
                    .clone()
                    .unwrap_or_else(relay_protocol::runs_dir);
                RunBuffer::File(Arc::new(FileRuns::new(dir)))
            }
        };
        Self {
            config,
            roots,
            buffer,
            active: ActiveRuns::default(),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> RunStrategy {
        match self.buffer {
            RunBuffer::Memory(_) => RunStrategy::Memory,
            RunBuffer::File(_) => RunStrategy::File,
        }
    }

    /// Spawn the agent and start buffering its output.
    pub async fn start(&self, req: &StartRun) -> Result<StartedRun, RunError> {
        let requested = match req.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(cwd) => expand_home(cwd),
            None => self.roots.first().cloned().ok_or(CwdError::NoRoots)?,
        };
        let cwd = validate_cwd(&requested, &self.roots).await?;

        let agent = agent_config(&self.config, req.mode);
        let program = resolve_binary(req.mode.as_str(), agent.binary.as_deref())?;
        let args = run_args(req.mode, &req.prompt, req.model.as_deref(), &agent.run_args);

        let run_id = uuid::Uuid::new_v4().to_string();
        let started = RunStarted {
            run_id: run_id.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };

        let writer = match &self.buffer {
            RunBuffer::Memory(runs) => RunWriter::Memory(runs.create(&run_id)),
            RunBuffer::File(runs) => RunWriter::File(runs.create(&run_id).await?),
        };
        // Attach before the pump exists so the first listener sees every line.
        let stream = if req.stream {
            let header = serde_json::to_string(&RunEvent::Run {
                run_id: run_id.clone(),
            })
            .map_err(std::io::Error::other)?;
            let head = futures_util::stream::once(async move { Bytes::from(header + "\n") });
            Some(head.chain(self.attach(&run_id)?).boxed())
        } else {
            None
        };

        let child = match agent::spawn(&program, &args, &cwd) {
            Ok(child) => child,
            Err(e) => {
                // Leave a complete, ended buffer behind for anyone already attached.
                let mut writer = writer;
                let failure = RunEvent::Result {
                    exit_code: None,
                    signal: None,
                    timed_out: false,
                    stopped: false,
                    duration_ms: 0,
                };
                if let Ok(line) = serde_json::to_string(&failure) {
                    writer.append(&line).await;
                }
                writer.finish().await;
                return Err(e.into());
            }
        };

        let stop = CancellationToken::new();
        self.active.lock().insert(run_id.clone(), stop.clone());
        tracing::info!(
            %run_id,
            agent = req.mode.as_str(),
            cwd = %cwd.display(),
            "run started"
        );

        let active = Arc::clone(&self.active);
        let idle_timeout = Duration::from_secs(self.config.runs.idle_timeout_secs);
        tokio::spawn(async move {
            agent::pump(run_id.clone(), child, writer, stop, idle_timeout).await;
            // After the result line, so file readers see ended only once both hold.
            active.lock().remove(&run_id);
        });

        Ok(StartedRun { started, stream })
    }

    fn attach(&self, run_id: &str) -> Result<LineStream, RunError> {
        match &self.buffer {
            RunBuffer::Memory(runs) => runs
                .get(run_id)
                .map(|run| run.attach())
                .ok_or_else(|| RunError::UnknownRun(run_id.to_string())),
            RunBuffer::File(runs) => Ok(runs.follow(
                run_id,
                Duration::from_millis(self.config.runs.poll_interval_ms),
                Arc::clone(&self.active),
            )),
        }
    }

    /// Replay-then-follow stream of a run's lines. Ends when the run does.
    pub async fn subscribe(&self, run_id: &str) -> Result<LineStream, RunError> {
        if let RunBuffer::File(runs) = &self.buffer
            && !runs.exists(run_id).await
        {
            return Err(RunError::UnknownRun(run_id.to_string()));
        }
        self.attach(run_id)
    }

    /// Complete lines from byte `offset`.
    pub async fn read(&self, run_id: &str, offset: u64) -> Result<RunOutput, RunError> {
        match &self.buffer {
            RunBuffer::Memory(runs) => runs
                .get(run_id)
                .map(|run| run.read(offset))
                .ok_or_else(|| RunError::UnknownRun(run_id.to_string())),
            RunBuffer::File(runs) => {
                let running = self.is_running(run_id);
                runs.read(run_id, offset, running).await
            }
        }
    }

    /// Ask a run to stop. Returns at once; the `result` line follows when the process is gone.
    pub async fn stop(&self, run_id: &str) -> Result<StopResponse, RunError> {
        let stop = self.active.lock().get(run_id).cloned();
        if let Some(stop) = stop {
            stop.cancel();
            return Ok(StopResponse {
                ok: true,
                stopping: true,
            });
        }
        let known = match &self.buffer {
            RunBuffer::Memory(runs) => runs.get(run_id).is_some(),
            RunBuffer::File(runs) => runs.exists(run_id).await,
        };
        if known {
            Ok(StopResponse {
                ok: true,
                stopping: false,
            })
        } else {
            Err(RunError::UnknownRun(run_id.to_string()))
        }
    }

    #[must_use]
    pub fn is_running(&self, run_id: &str) -> bool {
        self.active.lock().contains_key(run_id)
    }

    /// Drop ended runs and old run files.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        match &self.buffer {
            RunBuffer::Memory(runs) => {
                Ok(runs.sweep(Duration::from_secs(self.config.runs.retention_secs)))
            }
            RunBuffer::File(runs) => {
                runs.sweep(
                    Duration::from_secs(self.config.runs.file_retention_secs),
                    &self.active,
                )
                .await
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let runs = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match runs.sweep().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("swept {n} expired runs"),
                    Err(e) => tracing::warn!("run sweep failed: {e}"),
                }
            }
        })
    }
}
