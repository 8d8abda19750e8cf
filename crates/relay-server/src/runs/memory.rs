//! In-memory run buffers with live listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt as _;
use relay_protocol::RunOutput;
use tokio::sync::mpsc;

use super::LineStream;

#[derive(Default)]
struct RunState {
    buffer: Vec<u8>,
    ended_at: Option<Instant>,
    listeners: Vec<mpsc::UnboundedSender<Bytes>>,
}

/// One run's output. Buffer and listeners share a lock so attach never misses or repeats a line.
#[derive(Default)]
pub struct MemoryRun {
    state: parking_lot::Mutex<RunState>,
}

impl MemoryRun {
    pub fn append(&self, line: &str) {
        let mut state = self.state.lock();
        if state.ended_at.is_some() {
            return;
        }
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        state.buffer.extend_from_slice(&chunk);

        let chunk = Bytes::from(chunk);
        state.listeners.retain(|tx| tx.send(chunk.clone()).is_ok());
    }

    /// Mark the run ended and close every listener.
    pub fn end(&self) {
        let mut state = self.state.lock();
        if state.ended_at.is_none() {
            state.ended_at = Some(Instant::now());
        }
        state.listeners.clear();
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended_at.is_some()
    }

    #[must_use]
    pub fn read(&self, offset: u64) -> RunOutput {
        let state = self.state.lock();
        let len = state.buffer.len();
        let start = usize::try_from(offset).map_or(len, |o| o.min(len));
        RunOutput {
            output: String::from_utf8_lossy(&state.buffer[start..]).into_owned(),
            next_offset: len as u64,
            ended: state.ended_at.is_some(),
        }
    }

    /// Everything so far, then every later line until the run ends.
    #[must_use]
    pub fn attach(&self) -> LineStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let replay = {
            let mut state = self.state.lock();
            if state.ended_at.is_none() {
                state.listeners.push(tx);
            }
            Bytes::copy_from_slice(&state.buffer)
        };

        let live = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        futures_util::stream::iter((!replay.is_empty()).then_some(replay))
            .chain(live)
            .boxed()
    }

    fn expired(&self, retention: Duration) -> bool {
        self.state
            .lock()
            .ended_at
            .is_some_and(|ended| ended.elapsed() >= retention)
    }
}

/// Table of in-memory runs.
#[derive(Default)]
pub struct MemoryRuns {
    runs: parking_lot::Mutex<HashMap<String, Arc<MemoryRun>>>,
}

impl MemoryRuns {
    pub fn create(&self, run_id: &str) -> Arc<MemoryRun> {
        let run = Arc::new(MemoryRun::default());
        self.runs.lock().insert(run_id.to_string(), Arc::clone(&run));
        run
    }

    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<Arc<MemoryRun>> {
        self.runs.lock().get(run_id).cloned()
    }

    /// Drop runs that ended more than `retention` ago.
    pub fn sweep(&self, retention: Duration) -> usize {
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, run| !run.expired(retention));
        before - runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: LineStream) -> String {
        let chunks: Vec<Bytes> = stream.collect().await;
        chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_late_listener_sees_no_gap_and_no_duplicate() {
        let run = MemoryRun::default();
        run.append(r#"{"n":1}"#);
        run.append(r#"{"n":2}"#);

        let stream = run.attach();
        run.append(r#"{"n":3}"#);
        run.end();

        assert_eq!(collect(stream).await, "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");
    }

    #[tokio::test]
    async fn test_attach_after_end_is_replay_only() {
        let run = MemoryRun::default();
        run.append("a");
        run.end();
        run.append("ignored");
        assert_eq!(collect(run.attach()).await, "a\n");
    }

    #[test]
    fn test_offset_reads_are_stable() {
        let run = MemoryRun::default();
        run.append("one");
        let first = run.read(0);
        assert_eq!(first.output, "one\n");
        assert!(!first.ended);

        run.append("two");
        run.end();
        let second = run.read(first.next_offset);
        assert_eq!(second.output, "two\n");
        assert!(second.ended);

        // Re-reading the same offset gives the same answer.
        assert_eq!(run.read(first.next_offset), second);
        let tail = run.read(second.next_offset);
        assert_eq!(tail.output, "");
        assert_eq!(tail.next_offset, second.next_offset);
        assert_eq!(run.read(10_000).next_offset, second.next_offset);
    }

    #[test]
    fn test_sweep_keeps_running_runs() {
        let runs = MemoryRuns::default();
        runs.create("live");
        runs.create("done").end();
        assert_eq!(runs.sweep(Duration::ZERO), 1);
        assert!(runs.get("live").is_some());
        assert!(runs.get("done").is_none());
    }
}
