//! Mode to backend mapping, binary resolution and backend spawning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_config::{AgentConfig, Config};
use relay_protocol::{AgentKind, BackendKind, Mode};
use tokio::sync::mpsc;

use crate::error::SpawnError;
use crate::exec::{CommandPolicy, ExecHandle, ExecSettings};
use crate::pty::{PtyHandle, PtySpawn};
use crate::recording::Recorder;
use crate::session::{EventSink, Handle, SessionEvent};

const HUMAN_ID_WORDS: usize = 3;

/// The backend tried first for a mode.
#[must_use]
pub const fn preferred(mode: Mode) -> BackendKind {
    match mode {
        Mode::Restricted => BackendKind::RestrictedPty,
        Mode::Native => BackendKind::NativeExec,
        Mode::Claude => BackendKind::AgentPty(AgentKind::Claude),
        Mode::Codex => BackendKind::AgentPty(AgentKind::Codex),
        Mode::Gemini => BackendKind::AgentPty(AgentKind::Gemini),
    }
}

/// Where to go when `kind` cannot get a pseudo-terminal. Agents have nowhere to go.
#[must_use]
pub const fn fallback(kind: BackendKind) -> Option<BackendKind> {
    match kind {
        BackendKind::RestrictedPty => Some(BackendKind::RestrictedExec),
        BackendKind::RestrictedExec | BackendKind::NativeExec | BackendKind::AgentPty(_) => None,
    }
}

/// Fresh session id carrying the backend prefix, e.g. `pty-brave-quiet-otter`.
#[must_use]
pub fn session_id(kind: BackendKind) -> String {
    format!("{}-{}", kind.prefix(), human_id::gen_id(HUMAN_ID_WORDS))
}

#[must_use]
pub fn install_hint(name: &str) -> String {
    match name {
        "claude" => "install it with `npm install -g @anthropic-ai/claude-code`".to_string(),
        "codex" => "install it with `npm install -g @openai/codex`".to_string(),
        "gemini" => "install it with `npm install -g @google/gemini-cli`".to_string(),
        other => format!("install `{other}` or point the config at it"),
    }
}

/// Locate a program: the configured override if any, else `PATH`.
pub fn resolve_binary(name: &str, configured: Option<&Path>) -> Result<PathBuf, SpawnError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SpawnError::BinaryNotFound {
            name: name.to_string(),
            hint: format!("configured path {} does not exist", path.display()),
        });
    }
    which::which(name).map_err(|_| SpawnError::BinaryNotFound {
        name: name.to_string(),
        hint: install_hint(name),
    })
}

#[must_use]
pub fn agent_config(config: &Config, kind: AgentKind) -> &AgentConfig {
    match kind {
        AgentKind::Claude => &config.agents.claude,
        AgentKind::Codex => &config.agents.codex,
        AgentKind::Gemini => &config.agents.gemini,
    }
}

/// Non-interactive argv for an agent run (program excluded).
#[must_use]
pub fn run_args(kind: AgentKind, prompt: &str, model: Option<&str>, extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = match kind {
        AgentKind::Claude => vec![
            "-p".into(),
            prompt.into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ],
        AgentKind::Codex => vec!["exec".into(), "--json".into(), prompt.into()],
        AgentKind::Gemini => vec![
            "-p".into(),
            prompt.into(),
            "--output-format".into(),
            "json".into(),
        ],
    };
    if let Some(model) = model.filter(|m| !m.is_empty()) {
        args.push("--model".into());
        args.push(model.into());
    }
    args.extend(extra.iter().cloned());
    args
}

/// A spawned session, ready to register.
pub struct Spawned {
    pub session_id: String,
    pub kind: BackendKind,
    pub handle: Handle,
}

/// Everything needed to start any backend.
pub struct Backends {
    config: Arc<Config>,
    roots: Arc<[PathBuf]>,
    recorder: Arc<Recorder>,
    native: Arc<ExecSettings>,
    restricted: Arc<ExecSettings>,
}

impl Backends {
    #[must_use]
    pub fn new(config: Arc<Config>, recorder: Arc<Recorder>) -> Self {
        let roots: Arc<[PathBuf]> = config.sessions.effective_roots().into();
        let exec = |policy| {
            Arc::new(ExecSettings {
                shell: config.exec.shell.clone(),
                max_output_bytes: config.exec.max_output_bytes,
                command_timeout: Duration::from_secs(config.exec.command_timeout_secs),
                roots: Arc::clone(&roots),
                policy,
            })
        };
        let native = exec(None);
        let restricted = exec(Some(CommandPolicy::new(
            config.restricted.allow.clone(),
            config.restricted.deny.clone(),
        )));

        Self {
            config,
            roots,
            recorder,
            native,
            restricted,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Start a `kind` session and its recording. A failed spawn leaves no recording behind.
    pub fn spawn(
        &self,
        kind: BackendKind,
        cwd: &Path,
        cols: u16,
        rows: u16,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Spawned, SpawnError> {
        let session_id = session_id(kind);
        let sink = EventSink::new(session_id.clone(), events.clone());

        // Resolve the program before any tap exists.
        let pty_launch = match kind {
            BackendKind::RestrictedPty => Some(self.restricted_pty(cwd, cols, rows)?),
            BackendKind::AgentPty(agent) => Some(self.agent_pty(agent, cwd, cols, rows)?),
            BackendKind::RestrictedExec | BackendKind::NativeExec => None,
        };

        let tap = self.recorder.open(&session_id, kind.is_pty(), rows, cols);
        let handle = match (kind, pty_launch) {
            (_, Some(launch)) => match PtyHandle::spawn(launch, sink, tap) {
                Ok(pty) => Handle::Pty(pty),
                Err(e) => {
                    self.recorder.release(&session_id);
                    return Err(e);
                }
            },
            (BackendKind::RestrictedExec, None) => Handle::Exec(ExecHandle::spawn(
                Arc::clone(&self.restricted),
                cwd.to_path_buf(),
                sink,
                tap,
            )),
            (_, None) => Handle::Exec(ExecHandle::spawn(
                Arc::clone(&self.native),
                cwd.to_path_buf(),
                sink,
                tap,
            )),
        };

        Ok(Spawned {
            session_id,
            kind,
            handle,
        })
    }

    fn restricted_pty(&self, cwd: &Path, cols: u16, rows: u16) -> Result<PtySpawn, SpawnError> {
        let (program, args) = self.config.restricted.shell.split_first().ok_or_else(|| {
            SpawnError::InvalidCommand("restricted.shell is empty".to_string())
        })?;
        Ok(PtySpawn {
            program: resolve_binary(program, None)?,
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            cols,
            rows,
            env: Vec::new(),
            idle_timeout: None,
        })
    }

    fn agent_pty(
        &self,
        agent: AgentKind,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<PtySpawn, SpawnError> {
        let agent_config = agent_config(&self.config, agent);
        Ok(PtySpawn {
            program: resolve_binary(agent.as_str(), agent_config.binary.as_deref())?,
            args: agent_config.args.clone(),
            cwd: cwd.to_path_buf(),
            cols,
            rows,
            env: Vec::new(),
            idle_timeout: self
                .config
                .agents
                .session_idle_timeout_secs
                .map(Duration::from_secs),
        })
    }
}
