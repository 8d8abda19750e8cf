//! Line-buffered exec sessions for modes (or hosts) without a real terminal.
//!
//! There is no line discipline here, so [`LineEditor`] does the minimum: it
//! collects printable input, applies backspace, and flushes on CR/LF. Each
//! flushed line is queued and run as its own short-lived `sh -c` child, one at
//! a time. `cd`, `pwd` and empty lines never spawn a process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::paths::{expand_home, validate_cwd};
use crate::recording::Tap;
use crate::session::{EventSink, exit_parts};
use crate::utf8::{Utf8Decoder, to_crlf};

const IO_BUFFER_SIZE: usize = 4096;
const CHUNK_QUEUE: usize = 64;
const TIMEOUT_EXIT_CODE: i32 = 124;
const DENIED_EXIT_CODE: i32 = 126;
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Allow/deny list applied to restricted exec sessions.
///
/// Best effort only: it inspects the first word of every pipeline segment and
/// refuses substitution and output redirection. It is not a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl CommandPolicy {
    #[must_use]
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    pub fn check(&self, line: &str) -> Result<(), String> {
        if line.contains('`') || line.contains("$(") {
            return Err("command substitution is not permitted".to_string());
        }
        if line.contains('>') {
            return Err("output redirection is not permitted".to_string());
        }

        for segment in segments(line) {
            let words = shlex::split(segment).ok_or_else(|| "unbalanced quotes".to_string())?;
            let Some(program) = words.iter().find(|w| !is_assignment(w)) else {
                continue;
            };
            let program = program.as_str();
            let permitted = !program.contains('/')
                && !self.deny.iter().any(|d| d == program)
                && (self.allow.is_empty() || self.allow.iter().any(|a| a == program));
            if !permitted {
                return Err(format!("'{program}' is not permitted"));
            }
        }
        Ok(())
    }
}

/// Split a command line on `|`, `;` and `&` outside of quotes.
fn segments(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some('"'), '"') => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '|' | ';' | '&') => {
                out.push(&line[start..i]);
                start = i + ch.len_utf8();
            }
            (None, _) => {}
        }
    }
    out.push(&line[start..]);
    out
}

fn is_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Settings shared by every exec session of one kind.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub shell: String,
    pub max_output_bytes: usize,
    pub command_timeout: Duration,
    pub roots: Arc<[PathBuf]>,
    /// `Some` for restricted exec.
    pub policy: Option<CommandPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorAction {
    Line(String),
    Interrupt,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    Esc,
    Csi,
}

/// Minimal line editing for sessions without a terminal.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    decoder: Utf8Decoder,
    after_cr: bool,
    escape: Escape,
}

impl LineEditor {
    pub fn feed(&mut self, data: &[u8]) -> Vec<EditorAction> {
        let mut actions = Vec::new();
        let text = self.decoder.decode(data);

        for ch in text.chars() {
            let after_cr = std::mem::take(&mut self.after_cr);

            match self.escape {
                Escape::Esc => {
                    self.escape = if ch == '[' { Escape::Csi } else { Escape::None };
                    continue;
                }
                Escape::Csi => {
                    if ('@'..='~').contains(&ch) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match ch {
                '\n' if after_cr => {}
                '\r' | '\n' => {
                    actions.push(EditorAction::Line(std::mem::take(&mut self.buffer)));
                    self.after_cr = ch == '\r';
                }
                '\x7f' | '\x08' => {
                    self.buffer.pop();
                }
                '\x03' => {
                    self.buffer.clear();
                    actions.push(EditorAction::Interrupt);
                }
                '\x15' => self.buffer.clear(),
                '\x1b' => self.escape = Escape::Esc,
                '\t' => self.buffer.push('\t'),
                c if c.is_control() => {}
                c => self.buffer.push(c),
            }
        }
        actions
    }

    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Output budget for a single command.
#[derive(Debug)]
struct OutputBudget {
    limit: usize,
    used: usize,
    exceeded: bool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: 0,
            exceeded: false,
        }
    }

    /// How many of `len` new bytes may still be emitted.
    fn admit(&mut self, len: usize) -> usize {
        let remaining = self.limit - self.used;
        if len > remaining {
            self.exceeded = true;
            self.used = self.limit;
            remaining
        } else {
            self.used += len;
            len
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Builtin {
    Pwd,
    /// Arguments after `cd`, unquoted.
    Cd(Vec<String>),
}

impl Builtin {
    fn parse(line: &str) -> Option<Self> {
        let words = shlex::split(line)?;
        match words.first()?.as_str() {
            // `pwd | wc` and friends go to the shell.
            "pwd" if words.len() == 1 => Some(Builtin::Pwd),
            // Every `cd` is ours: a shell `cd` would not move the session.
            "cd" => Some(Builtin::Cd(words[1..].to_vec())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Truncated,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout = 0,
    Stderr = 1,
}

pub struct ExecHandle {
    editor: LineEditor,
    lines: mpsc::UnboundedSender<String>,
    running: Arc<parking_lot::Mutex<Option<Pid>>>,
    cancel: CancellationToken,
}

impl ExecHandle {
    /// Start the session's command queue. No process runs until a line is flushed.
    #[must_use]
    pub fn spawn(settings: Arc<ExecSettings>, cwd: PathBuf, sink: EventSink, tap: Tap) -> Self {
        let (lines, rx) = mpsc::unbounded_channel();
        let running = Arc::new(parking_lot::Mutex::new(None));
        let cancel = CancellationToken::new();

        tracing::info!(session_id = sink.session_id(), cwd = %cwd.display(), "exec session started");

        let worker = Worker {
            settings,
            cwd,
            sink,
            tap,
            running: Arc::clone(&running),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(rx));

        Self {
            editor: LineEditor::default(),
            lines,
            running,
            cancel,
        }
    }

    /// Feed keystrokes. Completed lines are queued; the call never waits for execution.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        for action in self.editor.feed(data) {
            match action {
                EditorAction::Line(line) => {
                    if self.lines.send(line).is_err() {
                        return false;
                    }
                }
                EditorAction::Interrupt => self.signal_running(Signal::SIGINT),
            }
        }
        true
    }

    fn signal_running(&self, signal: Signal) {
        if let Some(pgid) = *self.running.lock()
            && let Err(e) = nix::sys::signal::killpg(pgid, signal)
        {
            tracing::debug!("killpg({pgid}, {signal}) failed: {e}");
        }
    }

    /// Stop the queue and kill whatever is running.
    pub fn kill(&self) {
        self.cancel.cancel();
        self.signal_running(Signal::SIGKILL);
    }
}

impl Drop for ExecHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    settings: Arc<ExecSettings>,
    cwd: PathBuf,
    sink: EventSink,
    tap: Tap,
    running: Arc<parking_lot::Mutex<Option<Pid>>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut lines: mpsc::UnboundedReceiver<String>) {
        loop {
            let line = tokio::select! {
                () = self.cancel.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            self.execute(&line).await;
        }
        tracing::debug!(session_id = self.sink.session_id(), "exec queue stopped");
    }

    fn emit(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.tap.feed(text.as_bytes());
        self.sink.data(text);
    }

    fn finish(&self, code: Option<i32>, signal: Option<String>) {
        self.sink.exit(code, signal, false);
    }

    async fn execute(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            self.emit("\r\n");
            self.finish(Some(0), None);
            return;
        }

        match Builtin::parse(line) {
            Some(Builtin::Pwd) => {
                let text = format!("{}\r\n", self.cwd.display());
                self.emit(&text);
                self.finish(Some(0), None);
                return;
            }
            Some(Builtin::Cd(args)) => {
                self.change_dir(&args).await;
                return;
            }
            None => {}
        }

        if let Some(policy) = &self.settings.policy
            && let Err(reason) = policy.check(line)
        {
            self.emit(&format!("restricted: {reason}\r\n"));
            self.finish(Some(DENIED_EXIT_CODE), None);
            return;
        }

        self.run_command(line).await;
    }

    async fn change_dir(&mut self, args: &[String]) {
        let target = match args {
            [] => None,
            [target] => Some(target.as_str()),
            _ => {
                self.emit("cd: too many arguments\r\n");
                self.finish(Some(1), None);
                return;
            }
        };
        let target = match target {
            None | Some("~") => self
                .settings
                .roots
                .first()
                .cloned()
                .unwrap_or_else(|| self.cwd.clone()),
            // `~user` stays relative and lands under the session cwd.
            Some(t) => self.cwd.join(expand_home(t)),
        };

        match validate_cwd(&target, &self.settings.roots).await {
            Ok(real) => {
                self.cwd = real;
                self.finish(Some(0), None);
            }
            Err(e) => {
                self.emit(&format!("cd: {e}\r\n"));
                self.finish(Some(1), None);
            }
        }
    }

    async fn run_command(&mut self, line: &str) {
        let mut cmd = tokio::process::Command::new(&self.settings.shell);
        cmd.arg("-c")
            .arg(line)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.emit(&format!("{}: {e}\r\n", self.settings.shell));
                self.finish(Some(SPAWN_FAILED_EXIT_CODE), None);
                return;
            }
        };
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        *self.running.lock() = pgid;
        tracing::debug!(session_id = self.sink.session_id(), ?pgid, line, "exec command started");

        let (chunk_tx, mut chunks) = mpsc::channel(CHUNK_QUEUE);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_pipe(stdout, Pipe::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_pipe(stderr, Pipe::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let deadline = tokio::time::Instant::now() + self.settings.command_timeout;
        let mut decoders = [Utf8Decoder::default(), Utf8Decoder::default()];
        let mut budget = OutputBudget::new(self.settings.max_output_bytes);
        let mut ending = Ending::Completed;

        loop {
            tokio::select! {
                chunk = chunks.recv() => {
                    let Some((pipe, bytes)) = chunk else { break };
                    let allowed = budget.admit(bytes.len());
                    let text = decoders[pipe as usize].decode(&bytes[..allowed]);
                    self.emit(&to_crlf(&text));
                    if budget.exceeded {
                        ending = Ending::Truncated;
                        break;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    ending = Ending::TimedOut;
                    break;
                }
                () = self.cancel.cancelled() => {
                    ending = Ending::Cancelled;
                    break;
                }
            }
        }
        // Readers notice the closed queue and stop.
        drop(chunks);

        if ending == Ending::Completed {
            for decoder in &mut decoders {
                let tail = decoder.finish();
                self.emit(&to_crlf(&tail));
            }
        }

        // Pipes can close before the shell exits; the deadline still applies.
        let status = if ending == Ending::Completed {
            tokio::select! {
                status = child.wait() => status,
                () = tokio::time::sleep_until(deadline) => {
                    ending = Ending::TimedOut;
                    kill_group(pgid);
                    child.wait().await
                }
                () = self.cancel.cancelled() => {
                    ending = Ending::Cancelled;
                    kill_group(pgid);
                    child.wait().await
                }
            }
        } else {
            kill_group(pgid);
            child.wait().await
        };
        *self.running.lock() = None;

        let (code, signal) = match status {
            Ok(status) => exit_parts(status),
            Err(e) => {
                tracing::warn!("failed to wait for exec child: {e}");
                (None, None)
            }
        };

        match ending {
            Ending::Completed => self.finish(code, signal),
            Ending::Truncated => {
                self.emit(&format!(
                    "\r\n[output truncated: exceeded {} bytes]\r\n",
                    self.settings.max_output_bytes
                ));
                self.finish(code, signal);
            }
            Ending::TimedOut => {
                self.emit(&format!(
                    "\r\n[command timed out after {}s]\r\n",
                    self.settings.command_timeout.as_secs()
                ));
                self.finish(Some(TIMEOUT_EXIT_CODE), None);
            }
            // The session is closing; close reports its own exit.
            Ending::Cancelled => {}
        }
    }
}

fn kill_group(pgid: Option<Pid>) {
    if let Some(pgid) = pgid
        && let Err(e) = nix::sys::signal::killpg(pgid, Signal::SIGKILL)
    {
        tracing::debug!("killpg({pgid}) failed: {e}");
    }
}

async fn read_pipe(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    which: Pipe,
    tx: mpsc::Sender<(Pipe, Vec<u8>)>,
) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((which, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("exec pipe read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(actions: Vec<EditorAction>) -> Vec<String> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                EditorAction::Line(l) => Some(l),
                EditorAction::Interrupt => None,
            })
            .collect()
    }

    #[test]
    fn test_editor_flushes_on_cr_and_lf() {
        let mut editor = LineEditor::default();
        assert_eq!(lines(editor.feed(b"ls\rpwd\n")), vec!["ls", "pwd"]);
    }

    #[test]
    fn test_editor_crlf_counts_once() {
        let mut editor = LineEditor::default();
        assert_eq!(lines(editor.feed(b"echo a\r")), vec!["echo a"]);
        // The LF arrives in a later chunk.
        assert!(lines(editor.feed(b"\n")).is_empty());
        assert_eq!(lines(editor.feed(b"\n")), vec![""]);
    }

    #[test]
    fn test_editor_backspace_and_kill_line() {
        let mut editor = LineEditor::default();
        assert_eq!(lines(editor.feed(b"lsx\x7f -l\r")), vec!["ls -l"]);
        assert!(lines(editor.feed(b"garbage\x15")).is_empty());
        assert_eq!(editor.pending(), "");
        assert_eq!(lines(editor.feed(b"ab\x08\x08cd\n")), vec!["cd"]);
    }

    #[test]
    fn test_editor_ctrl_c_interrupts() {
        let mut editor = LineEditor::default();
        let actions = editor.feed(b"half typed\x03");
        assert_eq!(actions, vec![EditorAction::Interrupt]);
        assert_eq!(editor.pending(), "");
    }

    #[test]
    fn test_editor_ignores_escape_sequences() {
        let mut editor = LineEditor::default();
        // Up arrow, then a command.
        assert_eq!(lines(editor.feed(b"\x1b[Aecho hi\r")), vec!["echo hi"]);
    }

    #[test]
    fn test_editor_utf8_split_across_chunks() {
        let mut editor = LineEditor::default();
        let bytes = "echo é\n".as_bytes();
        assert!(lines(editor.feed(&bytes[..6])).is_empty());
        assert_eq!(lines(editor.feed(&bytes[6..])), vec!["echo é"]);
    }

    #[test]
    fn test_budget() {
        let mut budget = OutputBudget::new(10);
        assert_eq!(budget.admit(6), 6);
        assert!(!budget.exceeded);
        assert_eq!(budget.admit(4), 4);
        assert!(!budget.exceeded);
        assert_eq!(budget.admit(1), 0);
        assert!(budget.exceeded);
    }

    #[test]
    fn test_policy_allow_and_deny() {
        let policy = CommandPolicy::new(
            vec!["ls".into(), "grep".into(), "echo".into()],
            vec!["rm".into()],
        );
        assert!(policy.check("ls -la").is_ok());
        assert!(policy.check("ls | grep foo").is_ok());
        assert!(policy.check("FOO=1 echo hi").is_ok());
        assert_eq!(policy.check("rm -rf /"), Err("'rm' is not permitted".to_string()));
        assert_eq!(
            policy.check("ls && python3 x.py"),
            Err("'python3' is not permitted".to_string())
        );
        assert!(policy.check("/bin/ls").is_err());
        assert!(policy.check("echo $(id)").is_err());
        assert!(policy.check("echo hi > out.txt").is_err());
    }

    #[test]
    fn test_policy_empty_allow_means_deny_only() {
        let policy = CommandPolicy::new(vec![], vec!["sudo".into()]);
        assert!(policy.check("anything goes").is_ok());
        assert!(policy.check("sudo ls").is_err());
    }

    #[test]
    fn test_policy_sees_through_quotes() {
        let policy = CommandPolicy::new(vec!["ls".into(), "echo".into()], vec!["rm".into()]);
        assert_eq!(policy.check("'rm' -rf x"), Err("'rm' is not permitted".to_string()));
        assert_eq!(policy.check("\"rm\" x"), Err("'rm' is not permitted".to_string()));
        // Separators inside quotes are plain text.
        assert!(policy.check("echo 'a; rm b'").is_ok());
        assert!(policy.check("echo \"x | rm\"").is_ok());
        assert!(policy.check("echo 'unterminated").is_err());
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("a | b;c && d"), vec!["a ", " b", "c ", "", " d"]);
        assert_eq!(segments(r#"echo "a|b" 'c;d' e\&f"#), vec![r#"echo "a|b" 'c;d' e\&f"#]);
    }

    #[test]
    fn test_builtin_parse() {
        assert_eq!(Builtin::parse("pwd"), Some(Builtin::Pwd));
        assert_eq!(Builtin::parse("cd"), Some(Builtin::Cd(vec![])));
        assert_eq!(Builtin::parse("cd src"), Some(Builtin::Cd(vec!["src".into()])));
        assert_eq!(Builtin::parse("cd 'my dir'"), Some(Builtin::Cd(vec!["my dir".into()])));
        assert_eq!(Builtin::parse(r"cd my\ dir"), Some(Builtin::Cd(vec!["my dir".into()])));
        assert_eq!(
            Builtin::parse("cd a b"),
            Some(Builtin::Cd(vec!["a".into(), "b".into()]))
        );
        assert!(matches!(Builtin::parse("cd src && ls"), Some(Builtin::Cd(args)) if args.len() == 3));
        assert_eq!(Builtin::parse("pwd | cat"), None);
        assert_eq!(Builtin::parse("pwdx"), None);
        assert_eq!(Builtin::parse("echo 'open"), None);
    }

    fn settings(root: &std::path::Path) -> Arc<ExecSettings> {
        Arc::new(ExecSettings {
            shell: "/bin/sh".to_string(),
            max_output_bytes: 1024,
            command_timeout: Duration::from_secs(5),
            roots: vec![root.to_path_buf()].into(),
            policy: None,
        })
    }

    /// Run `lines` in a fresh session rooted at `root`; returns each command's output and exit code.
    async fn run_lines(root: &std::path::Path, lines: &[&str]) -> Vec<(String, Option<i32>)> {
        let recorder = crate::recording::Recorder::new(
            root.join("rec"),
            1024,
            Duration::from_secs(60),
        );
        let tap = recorder.open("exec-test", false, 24, 80);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("exec-test".to_string(), tx);
        let cwd = std::fs::canonicalize(root).unwrap();
        let mut handle = ExecHandle::spawn(settings(root), cwd, sink, tap);

        let mut results = Vec::new();
        for line in lines {
            assert!(handle.write(format!("{line}\r").as_bytes()));
            let mut output = String::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                match event {
                    crate::session::SessionEvent::Data { data, .. } => output.push_str(&data),
                    crate::session::SessionEvent::Exit { code, .. } => {
                        results.push((output, code));
                        break;
                    }
                }
            }
        }
        handle.kill();
        results
    }

    #[tokio::test]
    async fn test_cd_quoted_target_moves_session() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("my dir")).unwrap();
        let real = std::fs::canonicalize(root.path()).unwrap();

        let results = run_lines(root.path(), &["cd 'my dir'", "pwd"]).await;
        assert_eq!(results[0].1, Some(0));
        assert_eq!(results[1].0, format!("{}\r\n", real.join("my dir").display()));
    }

    #[tokio::test]
    async fn test_cd_extra_arguments_fail_without_moving() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a")).unwrap();
        let real = std::fs::canonicalize(root.path()).unwrap();

        let results = run_lines(root.path(), &["cd a b", "cd a && ls", "pwd"]).await;
        assert_eq!(results[0], ("cd: too many arguments\r\n".to_string(), Some(1)));
        assert_eq!(results[1].1, Some(1));
        assert_eq!(results[2].0, format!("{}\r\n", real.display()));
    }

    #[tokio::test]
    async fn test_cd_tilde_user_is_relative_to_session() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("sub/~nobody")).unwrap();
        let real = std::fs::canonicalize(root.path()).unwrap();

        let results = run_lines(root.path(), &["cd sub", "cd ~nobody", "pwd"]).await;
        assert_eq!(results[1].1, Some(0));
        assert_eq!(results[2].0, format!("{}\r\n", real.join("sub/~nobody").display()));
    }
}
