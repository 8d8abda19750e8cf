//! Configuration for relay terminal sessions and agent runs.

use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub exec: ExecConfig,
    pub restricted: RestrictedConfig,
    pub agents: AgentsConfig,
    pub runs: RunsConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Directories a session working directory must live under.
    /// Empty means the home directory.
    pub roots: Vec<PathBuf>,
    /// Maximum concurrent sessions per connection.
    pub max_sessions: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Shell used to run each line (`<shell> -c <line>`).
    pub shell: String,
    /// Output budget per command before truncation.
    pub max_output_bytes: usize,
    /// Hard wall-clock limit per command.
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RestrictedConfig {
    /// Argv of the restricted shell spawned on a PTY.
    pub shell: Vec<String>,
    /// Commands permitted in restricted exec mode. Empty allows anything not denied.
    pub allow: Vec<String>,
    /// Commands always refused in restricted exec mode.
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit executable path; looked up on PATH when unset.
    pub binary: Option<PathBuf>,
    /// Extra arguments for interactive PTY sessions.
    pub args: Vec<String>,
    /// Extra arguments for non-interactive runs.
    pub run_args: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub claude: AgentConfig,
    pub codex: AgentConfig,
    pub gemini: AgentConfig,
    /// Kill interactive agent sessions after this long without output.
    pub session_idle_timeout_secs: Option<u64>,
}

/// Storage strategy for agent run output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStrategy {
    /// In-memory buffer with live listener fan-out.
    #[default]
    Memory,
    /// Append-only file with offset polling.
    File,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RunsConfig {
    pub strategy: RunStrategy,
    /// Directory for file-buffered runs (defaults to the data directory).
    pub dir: Option<PathBuf>,
    /// How long an ended run stays addressable.
    pub retention_secs: u64,
    /// How long run files are kept on disk.
    pub file_retention_secs: u64,
    /// Kill a run after this long without output.
    pub idle_timeout_secs: u64,
    /// Poll interval for streaming file-buffered runs.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory for session logs (defaults to the data directory).
    pub dir: Option<PathBuf>,
    /// How long logs outlive their session.
    pub retention_secs: u64,
    /// Default tail returned by replay and log-backed snapshots.
    pub tail_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4180".to_string(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_sessions: 8,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            max_output_bytes: 256 * 1024,
            command_timeout_secs: 120,
        }
    }
}

impl Default for RestrictedConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| (*s).to_string()).collect();
        Self {
            shell: words(&["bash", "--restricted", "--noprofile", "--norc"]),
            allow: words(&[
                "ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "git", "diff", "tree",
                "stat", "file", "sort", "uniq", "cargo", "npm", "node", "python3", "make",
            ]),
            deny: words(&[
                "rm", "sudo", "su", "chmod", "chown", "dd", "mkfs", "shutdown", "reboot", "kill",
                "curl", "wget", "ssh", "scp",
            ]),
        }
    }
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            strategy: RunStrategy::Memory,
            dir: None,
            retention_secs: 120,
            file_retention_secs: 3600,
            idle_timeout_secs: 600,
            poll_interval_ms: 250,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_secs: 3600,
            tail_bytes: 64 * 1024,
            sweep_interval_secs: 300,
        }
    }
}

impl SessionsConfig {
    /// Configured roots, or the home directory when none are set.
    #[must_use]
    pub fn effective_roots(&self) -> Vec<PathBuf> {
        if self.roots.is_empty() {
            dirs::home_dir().into_iter().collect()
        } else {
            self.roots.clone()
        }
    }
}

/// Returns the config file path: ~/.config/relay/config.toml
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("relay")
        .join("config.toml")
}

/// Load configuration from default path, falling back to defaults if not found.
pub fn load() -> eyre::Result<Config> {
    load_from(&config_path())
}

/// Load configuration from an explicit path, falling back to defaults if not found.
pub fn load_from(path: &std::path::Path) -> eyre::Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sessions.max_sessions, 8);
        assert_eq!(config.exec.shell, "/bin/sh");
        assert_eq!(config.runs.strategy, RunStrategy::Memory);
        assert_eq!(config.restricted.shell[0], "bash");
        assert!(config.restricted.deny.iter().any(|c| c == "rm"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sessions]
            roots = ["/srv/projects"]
            max_sessions = 2

            [runs]
            strategy = "file"

            [agents.claude]
            binary = "/opt/claude/bin/claude"
            "#,
        )
        .unwrap();
        assert_eq!(config.sessions.roots, vec![PathBuf::from("/srv/projects")]);
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.sessions.default_cols, 80);
        assert_eq!(config.runs.strategy, RunStrategy::File);
        assert_eq!(config.runs.retention_secs, 120);
        assert_eq!(
            config.agents.claude.binary.as_deref(),
            Some(std::path::Path::new("/opt/claude/bin/claude"))
        );
        assert!(config.agents.codex.binary.is_none());
    }

    #[test]
    fn test_effective_roots_prefers_configured() {
        let mut sessions = SessionsConfig::default();
        sessions.roots = vec![PathBuf::from("/work")];
        assert_eq!(sessions.effective_roots(), vec![PathBuf::from("/work")]);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load_from(std::path::Path::new("/nonexistent/relay/config.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:4180");
    }
}
