//! Wire messages for the instance `cp` and `exec` endpoints
//!
//! Control messages travel as JSON text frames; file and terminal payload
//! travels as binary frames. Everything the server sends as a control frame
//! decodes into [`ControlMessage`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload chunk size for binary frames
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Exit code reported when a local I/O or protocol fault ends an exec session
pub const EXIT_FAULT: i32 = 255;

/// Exit code reported when the user interrupts an exec session (128 + SIGINT)
pub const EXIT_INTERRUPTED: i32 = 130;

/// First message of every `cp` connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum TransferRequest {
    To {
        guest_path: String,
        is_dir: bool,
        mode: u32,
        follow_links: bool,
        uid: u32,
        gid: u32,
    },
    From {
        guest_path: String,
        follow_links: bool,
    },
}

impl TransferRequest {
    pub fn guest_path(&self) -> &str {
        match self {
            TransferRequest::To { guest_path, .. } | TransferRequest::From { guest_path, .. } => {
                guest_path
            }
        }
    }
}

/// Entry descriptor sent by the server while pulling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_symlink: bool,
    #[serde(default)]
    pub link_target: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl FileHeader {
    pub fn is_regular(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }

    /// Ownership to apply locally; only archive mode carries it over.
    pub fn ownership(&self, archive: bool) -> Option<(u32, u32)> {
        archive.then_some((self.uid, self.gid))
    }

    /// Permission bits without file type bits
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// End of one entry (`final = false`) or of the whole transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndMarker {
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

/// Terminal message of a push connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
}

/// Out-of-band failure on a pull connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferError {
    pub message: String,
    #[serde(default)]
    pub path: String,
}

/// First message of every `exec` connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecExit {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

/// Typed control messages share one `type` discriminator on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TypedMessage {
    Header(FileHeader),
    End(EndMarker),
    Result(TransferResult),
    Error(TransferError),
    #[serde(other)]
    Unknown,
}

/// Every structured frame the server can send on either endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Header(FileHeader),
    End(EndMarker),
    Result(TransferResult),
    Error(TransferError),
    Exit(ExecExit),
    Unknown,
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Header(_) => "header",
            ControlMessage::End(_) => "end",
            ControlMessage::Result(_) => "result",
            ControlMessage::Error(_) => "error",
            ControlMessage::Exit(_) => "exit",
            ControlMessage::Unknown => "unknown",
        }
    }
}

impl From<TypedMessage> for ControlMessage {
    fn from(msg: TypedMessage) -> Self {
        match msg {
            TypedMessage::Header(h) => ControlMessage::Header(h),
            TypedMessage::End(e) => ControlMessage::End(e),
            TypedMessage::Result(r) => ControlMessage::Result(r),
            TypedMessage::Error(e) => ControlMessage::Error(e),
            TypedMessage::Unknown => ControlMessage::Unknown,
        }
    }
}
