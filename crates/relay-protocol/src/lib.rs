//! Shared protocol types for relay terminal sessions and agent runs.

/// Client-assigned request correlation id, echoed verbatim on every `*.resp`.
pub type RequestId = serde_json::Value;

/// Coding-agent CLIs that can back a PTY session or a non-interactive run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }
}

/// Logical mode requested by the client in an `open` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Restricted,
    Native,
    Claude,
    Codex,
    Gemini,
}

impl Mode {
    /// The agent CLI behind this mode, if any.
    #[must_use]
    pub const fn agent(self) -> Option<AgentKind> {
        match self {
            Mode::Claude => Some(AgentKind::Claude),
            Mode::Codex => Some(AgentKind::Codex),
            Mode::Gemini => Some(AgentKind::Gemini),
            Mode::Restricted | Mode::Native => None,
        }
    }
}

impl From<AgentKind> for Mode {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Claude => Mode::Claude,
            AgentKind::Codex => Mode::Codex,
            AgentKind::Gemini => Mode::Gemini,
        }
    }
}

/// Concrete backend that owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BackendKind {
    RestrictedPty,
    RestrictedExec,
    NativeExec,
    AgentPty(AgentKind),
}

impl BackendKind {
    /// Whether the child owns a real pseudo-terminal.
    #[must_use]
    pub const fn is_pty(self) -> bool {
        matches!(self, BackendKind::RestrictedPty | BackendKind::AgentPty(_))
    }

    /// Prefix used for session ids owned by this backend.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            BackendKind::RestrictedPty => "pty",
            BackendKind::RestrictedExec => "rexec",
            BackendKind::NativeExec => "exec",
            BackendKind::AgentPty(kind) => kind.as_str(),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendKind::RestrictedPty => "restricted-pty",
            BackendKind::RestrictedExec => "restricted-exec",
            BackendKind::NativeExec => "native-exec",
            BackendKind::AgentPty(AgentKind::Claude) => "claude-pty",
            BackendKind::AgentPty(AgentKind::Codex) => "codex-pty",
            BackendKind::AgentPty(AgentKind::Gemini) => "gemini-pty",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for BackendKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "restricted-pty" => Ok(BackendKind::RestrictedPty),
            "restricted-exec" => Ok(BackendKind::RestrictedExec),
            "native-exec" => Ok(BackendKind::NativeExec),
            "claude-pty" => Ok(BackendKind::AgentPty(AgentKind::Claude)),
            "codex-pty" => Ok(BackendKind::AgentPty(AgentKind::Codex)),
            "gemini-pty" => Ok(BackendKind::AgentPty(AgentKind::Gemini)),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Just enough of an inbound frame to answer it even when the body is malformed.
#[derive(Debug, Default, serde::Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<RequestId>,
}

/// Control requests sent by the client over the duplex connection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Spawn a new session.
    Open {
        cwd: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        mode: Option<Mode>,
    },
    /// Write input to a session.
    Stdin { session_id: String, data: String },
    /// Resize a session.
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Tear down a session.
    Close { session_id: String },
}

impl Request {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Stdin { .. } => "stdin",
            Request::Resize { .. } => "resize",
            Request::Close { .. } => "close",
        }
    }
}

/// Frames sent by the server: `*.resp` replies and unsolicited session events.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "open.resp", rename_all = "camelCase")]
    OpenResp {
        request_id: Option<RequestId>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<Mode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        backend: Option<BackendKind>,
        #[serde(default)]
        fallback: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        notice: Option<String>,
    },
    #[serde(rename = "stdin.resp", rename_all = "camelCase")]
    StdinResp {
        request_id: Option<RequestId>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        session_id: Option<String>,
    },
    #[serde(rename = "resize.resp", rename_all = "camelCase")]
    ResizeResp {
        request_id: Option<RequestId>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        session_id: Option<String>,
    },
    #[serde(rename = "close.resp", rename_all = "camelCase")]
    CloseResp {
        request_id: Option<RequestId>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        session_id: Option<String>,
        /// False when the session was already gone.
        #[serde(default)]
        existed: bool,
    },
    /// Session output.
    #[serde(rename = "data", rename_all = "camelCase")]
    Data { session_id: String, data: String },
    /// Process (PTY) or command (exec) exit.
    #[serde(rename = "exit", rename_all = "camelCase")]
    Exit {
        session_id: String,
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl ServerFrame {
    /// A failed reply of the right `*.resp` type for a request kind.
    #[must_use]
    pub fn failure(kind: &str, request_id: Option<RequestId>, error: String) -> serde_json::Value {
        serde_json::json!({
            "type": format!("{kind}.resp"),
            "requestId": request_id,
            "ok": false,
            "error": error,
        })
    }
}

/// Body of `POST /api/runs/start`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRun {
    pub prompt: String,
    pub mode: AgentKind,
    pub cwd: Option<String>,
    pub model: Option<String>,
    /// Attach the initiating request as the first live listener.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: String,
    pub started_at: String,
}

/// Offset-polling reply.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub output: String,
    pub next_offset: u64,
    pub ended: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StopResponse {
    pub ok: bool,
    pub stopping: bool,
}

/// Lines written into a run buffer by the server itself.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    /// First line of a stream opened by `start` with `stream: true`.
    #[serde(rename_all = "camelCase")]
    Run { run_id: String },
    /// Non-JSON stdout line from the agent.
    Text { text: String },
    /// Stderr line from the agent.
    Stderr { text: String },
    /// Terminal line; appended exactly once after the process exits.
    #[serde(rename_all = "camelCase")]
    Result {
        exit_code: Option<i32>,
        signal: Option<String>,
        timed_out: bool,
        stopped: bool,
        duration_ms: u64,
    },
}

impl RunEvent {
    /// Whether a raw buffer line is a terminal `result` event.
    #[must_use]
    pub fn is_result_line(line: &str) -> bool {
        #[derive(serde::Deserialize)]
        struct Tag<'a> {
            #[serde(rename = "type", borrow)]
            kind: Option<&'a str>,
        }
        serde_json::from_str::<Tag<'_>>(line)
            .map(|t| t.kind == Some("result"))
            .unwrap_or(false)
    }
}

/// Where a snapshot's `data` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Rendered from the live terminal emulator.
    Emulator,
    /// Raw tail of the recording log.
    Log,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    pub data: String,
    pub source: SnapshotSource,
}

/// Root directory for relay state.
#[must_use]
pub fn data_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .map(|d| d.join("relay"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".relay")))
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp/relay"))
}

/// Directory holding per-session recordings.
#[must_use]
pub fn recordings_dir() -> std::path::PathBuf {
    data_dir().join("recordings")
}

/// Directory holding file-buffered run output.
#[must_use]
pub fn runs_dir() -> std::path::PathBuf {
    data_dir().join("runs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_request_parses_camel_case() {
        let req: Request = serde_json::from_str(
            r#"{"type":"open","requestId":"r1","cwd":"/tmp","cols":100,"rows":30,"mode":"native"}"#,
        )
        .unwrap();
        match req {
            Request::Open {
                cwd,
                cols,
                rows,
                mode,
            } => {
                assert_eq!(cwd.as_deref(), Some("/tmp"));
                assert_eq!(cols, Some(100));
                assert_eq!(rows, Some(30));
                assert_eq!(mode, Some(Mode::Native));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_stdin_requires_session_id() {
        let err = serde_json::from_str::<Request>(r#"{"type":"stdin","data":"ls\n"}"#);
        assert!(err.is_err());

        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"stdin","requestId":7,"data":"ls\n"}"#).unwrap();
        assert_eq!(envelope.kind.as_deref(), Some("stdin"));
        assert_eq!(envelope.request_id, Some(serde_json::json!(7)));
    }

    #[test]
    fn test_response_type_names() {
        let frame = ServerFrame::CloseResp {
            request_id: Some(serde_json::json!("abc")),
            ok: true,
            error: None,
            session_id: Some("pty-x".to_string()),
            existed: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "close.resp");
        assert_eq!(value["requestId"], "abc");
        assert_eq!(value["sessionId"], "pty-x");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failure_uses_request_kind() {
        let value = ServerFrame::failure("bogus", Some(serde_json::json!(1)), "nope".into());
        assert_eq!(value["type"], "bogus.resp");
        assert_eq!(value["ok"], false);
        assert_eq!(value["requestId"], 1);
    }

    #[test]
    fn test_backend_kind_wire_names() {
        let json = serde_json::to_string(&BackendKind::AgentPty(AgentKind::Codex)).unwrap();
        assert_eq!(json, "\"codex-pty\"");
        let back: BackendKind = serde_json::from_str("\"restricted-exec\"").unwrap();
        assert_eq!(back, BackendKind::RestrictedExec);
        assert!(!back.is_pty());
        assert!(BackendKind::RestrictedPty.is_pty());
    }

    #[test]
    fn test_result_line_detection() {
        let line = serde_json::to_string(&RunEvent::Result {
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            stopped: false,
            duration_ms: 12,
        })
        .unwrap();
        assert!(line.contains("\"timedOut\":false"));
        assert!(RunEvent::is_result_line(&line));
        assert!(!RunEvent::is_result_line(r#"{"type":"text","text":"hi"}"#));
        assert!(!RunEvent::is_result_line("not json"));
    }
}
