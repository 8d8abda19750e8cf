//! Per-connection request dispatch.
//!
//! A [`Connection`] owns the sessions opened on one duplex connection. Inbound
//! frames produce exactly one `*.resp` when they carry a `requestId`; session
//! events are turned into `data`/`exit` frames. The caller moves the returned
//! frames onto the wire in order.

use std::path::PathBuf;
use std::sync::Arc;

use relay_protocol::{BackendKind, Envelope, Mode, Request, RequestId, ServerFrame};
use tokio::sync::mpsc;

use crate::backend::{self, Backends, Spawned};
use crate::error::{CwdError, RequestError, SpawnError};
use crate::paths::{expand_home, validate_cwd};
use crate::session::{SessionEntry, SessionEvent, SessionRegistry};

pub struct Connection {
    backends: Arc<Backends>,
    registry: SessionRegistry,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

struct Opened {
    session_id: String,
    cwd: PathBuf,
    backend: BackendKind,
    fallback: bool,
    notice: Option<String>,
}

fn encode(frame: &ServerFrame) -> String {
    // ServerFrame holds only strings, numbers and JSON values.
    serde_json::to_string(frame).unwrap_or_default()
}

impl Connection {
    #[must_use]
    pub fn new(backends: Arc<Backends>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let max_sessions = backends.config().sessions.max_sessions;
        Self {
            backends,
            registry: SessionRegistry::new(max_sessions),
            events_tx,
            events_rx,
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Next event from any session on this connection.
    pub async fn next_event(&mut self) -> SessionEvent {
        // The connection keeps a sender alive, so the channel never closes.
        match self.events_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    /// Handle one inbound text frame, returning the frames to send.
    pub async fn handle_text(&mut self, text: &str) -> Vec<String> {
        let envelope = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("unparseable frame: {e}");
                return Vec::new();
            }
        };

        let request = match serde_json::from_str::<Request>(text) {
            Ok(request) => request,
            Err(e) => {
                let Some(request_id) = envelope.request_id else {
                    tracing::debug!("dropping malformed frame without requestId: {e}");
                    return Vec::new();
                };
                let kind = match envelope.kind.as_deref() {
                    Some(kind @ ("open" | "stdin" | "resize" | "close")) => {
                        return vec![
                            ServerFrame::failure(
                                kind,
                                Some(request_id),
                                RequestError::Malformed(e.to_string()).to_string(),
                            )
                            .to_string(),
                        ];
                    }
                    Some(other) => other.to_string(),
                    None => "error".to_string(),
                };
                return vec![
                    serde_json::json!({
                        "type": "error.resp",
                        "requestId": request_id,
                        "ok": false,
                        "error": format!("unknown request type: {kind}"),
                    })
                    .to_string(),
                ];
            }
        };

        tracing::debug!(kind = request.kind(), "request");
        let request_id = envelope.request_id;
        let mut out = Vec::new();

        match request {
            Request::Open {
                cwd,
                cols,
                rows,
                mode,
            } => {
                let mode = mode.unwrap_or(Mode::Restricted);
                let frame = match self.open(cwd, cols, rows, mode).await {
                    Ok(opened) => ServerFrame::OpenResp {
                        request_id: request_id.clone(),
                        ok: true,
                        error: None,
                        session_id: Some(opened.session_id),
                        cwd: Some(opened.cwd.display().to_string()),
                        mode: Some(mode),
                        backend: Some(opened.backend),
                        fallback: opened.fallback,
                        notice: opened.notice,
                    },
                    Err(e) => {
                        tracing::info!("open failed: {e}");
                        ServerFrame::OpenResp {
                            request_id: request_id.clone(),
                            ok: false,
                            error: Some(e.to_string()),
                            session_id: None,
                            cwd: None,
                            mode: Some(mode),
                            backend: None,
                            fallback: false,
                            notice: None,
                        }
                    }
                };
                push_reply(&mut out, request_id.as_ref(), &frame);
            }
            Request::Stdin { session_id, data } => {
                let result = self.stdin(&session_id, data.as_bytes());
                let frame = ServerFrame::StdinResp {
                    request_id: request_id.clone(),
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    session_id: Some(session_id),
                };
                push_reply(&mut out, request_id.as_ref(), &frame);
            }
            Request::Resize {
                session_id,
                cols,
                rows,
            } => {
                let result = self.resize(&session_id, cols, rows);
                let frame = ServerFrame::ResizeResp {
                    request_id: request_id.clone(),
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    session_id: Some(session_id),
                };
                push_reply(&mut out, request_id.as_ref(), &frame);
            }
            Request::Close { session_id } => {
                let closed = self.close(&session_id);
                let frame = ServerFrame::CloseResp {
                    request_id: request_id.clone(),
                    ok: true,
                    error: None,
                    session_id: Some(session_id.clone()),
                    existed: closed.is_some(),
                };
                push_reply(&mut out, request_id.as_ref(), &frame);
                out.push(encode(&ServerFrame::Exit {
                    session_id,
                    code: None,
                    signal: closed.flatten().map(str::to_string),
                }));
            }
        }
        out
    }

    /// Translate a session event into an outbound frame.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<String> {
        if !self.registry.contains(event.session_id()) {
            return None;
        }
        match event {
            SessionEvent::Data { session_id, data } => {
                Some(encode(&ServerFrame::Data { session_id, data }))
            }
            SessionEvent::Exit {
                session_id,
                code,
                signal,
                terminal,
            } => {
                if terminal {
                    self.registry.remove(&session_id);
                    self.backends.recorder().release(&session_id);
                    tracing::info!(%session_id, ?code, "session ended");
                }
                Some(encode(&ServerFrame::Exit {
                    session_id,
                    code,
                    signal,
                }))
            }
        }
    }

    /// Kill and release every session. Called when the connection goes away.
    pub fn shutdown(&mut self) {
        for (session_id, entry) in self.registry.drain() {
            entry.handle.kill();
            self.backends.recorder().release(&session_id);
        }
    }

    async fn open(
        &mut self,
        cwd: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        mode: Mode,
    ) -> Result<Opened, RequestError> {
        self.registry.ensure_capacity()?;

        let roots = self.backends.roots();
        let requested = match cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(cwd) => expand_home(cwd),
            None => roots.first().cloned().ok_or(CwdError::NoRoots)?,
        };
        let cwd = validate_cwd(&requested, roots).await?;

        let sessions = &self.backends.config().sessions;
        let cols = cols.filter(|c| *c > 0).unwrap_or(sessions.default_cols);
        let rows = rows.filter(|r| *r > 0).unwrap_or(sessions.default_rows);

        let preferred = backend::preferred(mode);
        let (spawned, notice) =
            match self.backends.spawn(preferred, &cwd, cols, rows, &self.events_tx) {
                Ok(spawned) => (spawned, None),
                Err(SpawnError::PtyUnavailable(e)) => {
                    let Some(next) = backend::fallback(preferred) else {
                        return Err(SpawnError::PtyUnavailable(e).into());
                    };
                    tracing::warn!("{preferred} unavailable ({e}), falling back to {next}");
                    let spawned = self.backends.spawn(next, &cwd, cols, rows, &self.events_tx)?;
                    let notice = format!(
                        "pseudo-terminal unavailable ({e}); using line-buffered {next} instead"
                    );
                    (spawned, Some(notice))
                }
                Err(e) => return Err(e.into()),
            };

        let Spawned {
            session_id,
            kind,
            handle,
        } = spawned;
        tracing::info!(%session_id, backend = %kind, cwd = %cwd.display(), "session opened");

        self.registry.insert(
            session_id.clone(),
            SessionEntry {
                kind,
                cwd: cwd.clone(),
                cols,
                rows,
                handle,
            },
        );

        Ok(Opened {
            session_id,
            cwd,
            backend: kind,
            fallback: notice.is_some(),
            notice,
        })
    }

    fn stdin(&mut self, session_id: &str, data: &[u8]) -> Result<(), RequestError> {
        let entry = self
            .registry
            .get_mut(session_id)
            .ok_or_else(|| RequestError::UnknownSession(session_id.to_string()))?;
        if entry.handle.write(data) {
            Ok(())
        } else {
            Err(RequestError::SessionGone(session_id.to_string()))
        }
    }

    fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), RequestError> {
        if cols == 0 || rows == 0 {
            return Err(RequestError::Malformed(format!(
                "invalid size {cols}x{rows}"
            )));
        }
        let entry = self
            .registry
            .get_mut(session_id)
            .ok_or_else(|| RequestError::UnknownSession(session_id.to_string()))?;
        entry.cols = cols;
        entry.rows = rows;
        entry.handle.resize(cols, rows);
        if let Some(tap) = self.backends.recorder().tap(session_id) {
            tap.resize(rows, cols);
        }
        Ok(())
    }

    /// Returns `None` if the session was unknown, else the signal used to end it.
    fn close(&mut self, session_id: &str) -> Option<Option<&'static str>> {
        let entry = self.registry.remove(session_id)?;
        let signal = entry.handle.kill();
        self.backends.recorder().release(session_id);
        tracing::info!(session_id, "session closed");
        Some(signal)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn push_reply(out: &mut Vec<String>, request_id: Option<&RequestId>, frame: &ServerFrame) {
    // Fire-and-forget frames get no reply.
    if request_id.is_some() {
        out.push(encode(frame));
    }
}
