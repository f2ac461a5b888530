//! Build event stream client
//!
//! Consumes a server-sent event stream of JSON build events. Log lines go to
//! stdout; status changes are reported on stderr and decide when the stream
//! is finished.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildEvent {
    Log {
        #[serde(default)]
        content: String,
    },
    Status {
        #[serde(default)]
        status: String,
    },
    Heartbeat,
    #[serde(other)]
    Other,
}

/// Parse one SSE line. Returns `None` for blank lines, comments, non-data
/// fields and malformed JSON.
pub fn parse_line(line: &str) -> Option<BuildEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(data).ok()
}

/// Terminal-state tracking for `queued → building → pushing → ready|failed|cancelled`
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: String,
}

impl StatusTracker {
    /// Record a status; `Some` once the stream should stop.
    pub fn observe<E: Write>(&mut self, status: &str, err: &mut E) -> Option<Result<()>> {
        self.last = status.to_string();
        let note = match status {
            "queued" => "Build queued...",
            "building" => "Building...",
            "pushing" => "Pushing image...",
            "ready" => {
                let _ = writeln!(err, "Build complete!");
                return Some(Ok(()));
            }
            "failed" => return None,
            "cancelled" => return Some(Err(anyhow!("build was cancelled"))),
            _ => return None,
        };
        let _ = writeln!(err, "{}", note);
        None
    }

    /// Outcome when the stream ends on its own
    pub fn at_end(&self) -> Result<()> {
        if self.last == "failed" {
            bail!("build failed");
        }
        if self.last == "ready" {
            return Ok(());
        }
        bail!("build stream ended unexpectedly (status: {})", self.last)
    }
}

/// Follow an event stream to completion.
pub async fn follow<S, E, O, W>(mut chunks: S, out: &mut O, err: &mut W) -> Result<()>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    O: Write,
    W: Write,
{
    let mut tracker = StatusTracker::default();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.context("read build events")?;
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(done) = handle_line(&line, &mut tracker, out, err)? {
                return done;
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        if let Some(done) = handle_line(&line, &mut tracker, out, err)? {
            return done;
        }
    }
    tracker.at_end()
}

fn handle_line<O: Write, W: Write>(
    line: &str,
    tracker: &mut StatusTracker,
    out: &mut O,
    err: &mut W,
) -> Result<Option<Result<()>>> {
    match parse_line(line) {
        Some(BuildEvent::Log { content }) => {
            writeln!(out, "{}", content).context("write build log")?;
            Ok(None)
        }
        Some(BuildEvent::Status { status }) => Ok(tracker.observe(&status, err)),
        _ => Ok(None),
    }
}
