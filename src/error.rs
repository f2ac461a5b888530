//! Error taxonomy for copy and exec operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopyError {
    // Resolution: reported before any connection is opened
    #[error("destination directory {0} does not exist")]
    DestinationDirMissing(String),
    #[error("cannot copy a directory to a file")]
    DirectoryOntoFile,
    #[error("source path {0} does not exist in guest")]
    SourceMissing(String),

    // Sanitization
    #[error("invalid tar entry: {reason}: {entry}")]
    UnsafeEntry { entry: String, reason: &'static str },

    // Protocol integrity
    #[error("file {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("received {len} payload bytes outside of a regular file entry")]
    PayloadOutsideFile { len: usize },
    #[error("unexpected {0} message")]
    UnexpectedMessage(String),
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("copy stream ended without completion marker")]
    Incomplete,

    // Remote-reported
    #[error("copy error at {path}: {message}")]
    Remote { message: String, path: String },
    #[error("copy failed: {0}")]
    Rejected(String),

    // Connection
    #[error("websocket connect failed (HTTP {status}): {body}")]
    Handshake { status: u16, body: String },
    #[error("connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
}

impl CopyError {
    pub(crate) fn unsafe_entry(entry: &str, reason: &'static str) -> Self {
        CopyError::UnsafeEntry {
            entry: entry.to_string(),
            reason,
        }
    }
}

/// True when the error chain bottoms out in a broken local pipe.
pub fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::BrokenPipe)
    })
}
