//! Shared protocol logic for push and pull transfers
//!
//! Entry names and guest paths always use forward-slash semantics, whatever
//! the host OS is.

use crate::error::CopyError;
use crate::protocol::{ControlMessage, ExecExit, TypedMessage};
use std::path::{Path, PathBuf};

/// Lexically clean a slash-separated path.
///
/// Collapses repeated slashes, drops `.` segments and resolves `..` against
/// preceding segments. A rooted path never climbs above `/`; a relative path
/// keeps leading `..` segments. The empty path cleans to `.`.
pub fn clean_slash_path(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join two slash-separated paths and clean the result
pub fn join_slash(base: &str, name: &str) -> String {
    if base.is_empty() {
        return clean_slash_path(name);
    }
    clean_slash_path(&format!("{}/{}", base, name))
}

/// Last segment of a slash-separated path (`/` for the root, `.` for empty)
pub fn slash_basename(p: &str) -> &str {
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return if p.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Clean an entry name and make sure it is a relative path that stays below
/// its base.
pub fn clean_entry_name(entry: &str) -> Result<String, CopyError> {
    if entry.contains('\0') {
        return Err(CopyError::unsafe_entry(entry, "path contains NUL byte"));
    }
    let clean = clean_slash_path(entry);
    if clean.starts_with('/') {
        return Err(CopyError::unsafe_entry(entry, "absolute path not allowed"));
    }
    if clean == ".." || clean.starts_with("../") {
        return Err(CopyError::unsafe_entry(entry, "path escapes destination"));
    }
    Ok(clean)
}

/// Resolve an archive/header entry name against a guest base path.
///
/// Rejects absolute names and parent escapes, then re-checks that the joined
/// result stays under the cleaned base. A base of `/` accepts any absolute
/// result.
pub fn sanitize_entry_path(base: &str, entry: &str) -> Result<String, CopyError> {
    let clean = clean_entry_name(entry)?;
    let target = join_slash(base, &clean);
    let clean_base = clean_slash_path(base);

    if clean_base == "/" {
        if !target.starts_with('/') {
            return Err(CopyError::unsafe_entry(entry, "path escapes destination"));
        }
    } else if target != clean_base && !target.starts_with(&format!("{}/", clean_base)) {
        return Err(CopyError::unsafe_entry(entry, "path escapes destination"));
    }
    Ok(target)
}

/// Local-filesystem counterpart of [`sanitize_entry_path`]: the cleaned
/// entry segments are pushed onto `base` one by one.
pub fn sanitize_local_path(base: &Path, entry: &str) -> Result<PathBuf, CopyError> {
    let clean = clean_entry_name(entry)?;
    let mut target = base.to_path_buf();
    if clean == "." {
        return Ok(target);
    }
    for seg in clean.split('/') {
        // On Windows a backslash or drive colon inside a segment would be reinterpreted
        #[cfg(windows)]
        if seg.contains('\\') || seg.contains(':') {
            return Err(CopyError::unsafe_entry(entry, "path component not allowed"));
        }
        target.push(seg);
    }
    if !target.starts_with(base) {
        return Err(CopyError::unsafe_entry(entry, "path escapes destination"));
    }
    Ok(target)
}

/// Decode a text frame into a control message.
///
/// Frames carrying a `type` discriminator are transfer messages; a frame with
/// an `exitCode` field is the exec completion message. Anything else decodes
/// as [`ControlMessage::Unknown`].
pub fn decode_control(text: &str) -> Result<ControlMessage, CopyError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("type").is_some() {
        let typed: TypedMessage = serde_json::from_value(value)?;
        return Ok(typed.into());
    }
    if value.get("exitCode").is_some() {
        let exit: ExecExit = serde_json::from_value(value)?;
        return Ok(ControlMessage::Exit(exit));
    }
    Ok(ControlMessage::Unknown)
}
