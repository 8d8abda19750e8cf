//! Session orchestration and durable streaming for relay.
//!
//! One WebSocket per client multiplexes PTY and exec sessions; agent runs are
//! served over plain HTTP and survive the client going away.

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod http;
pub mod paths;
pub mod pty;
pub mod recording;
pub mod runs;
pub mod screen;
pub mod session;
pub mod utf8;

use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr as _;
use relay_config::Config;

pub use http::{AppState, router};

/// Shared state for a server built from `config`.
#[must_use]
pub fn build(config: Arc<Config>) -> AppState {
    let recorder = Arc::new(recording::Recorder::from_config(&config));
    AppState {
        backends: Arc::new(backend::Backends::new(Arc::clone(&config), recorder)),
        runs: Arc::new(runs::RunManager::new(config)),
    }
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: Config) -> eyre::Result<()> {
    let config = Arc::new(config);
    let state = build(Arc::clone(&config));

    let recording_sweep = Duration::from_secs(config.recording.sweep_interval_secs.max(1));
    let _recording_sweeper = state.backends.recorder().spawn_sweeper(recording_sweep);
    let run_sweep = Duration::from_secs(config.runs.retention_secs.clamp(1, 60));
    let _run_sweeper = state.runs.spawn_sweeper(run_sweep);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(
        addr = %config.server.bind,
        recordings = %state.backends.recorder().dir().display(),
        roots = ?state.backends.roots(),
        "relay listening"
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("server error")?;
    Ok(())
}
