//! Bounded capture of engine stdout/stderr.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// The last `capacity` lines the engine printed, shared between the reader
/// tasks and whoever needs diagnostics.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputLog {
    /// Keep at most `capacity` lines (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Captured lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Whether any captured line contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.lock().iter().any(|line| line.contains(pattern))
    }

    /// Captured lines joined with newlines.
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }

    /// Forward lines from `reader` into the log (and to `tracing` under
    /// target `engine`) until EOF.
    pub(crate) fn spawn_reader<R>(&self, reader: R, stream: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(target: "engine", "[{}] {}", stream, line);
                        log.push(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Stopped reading engine {}: {}", stream, e);
                        break;
                    }
                }
            }
        })
    }
}
