//! Destination resolution with `docker cp`-style semantics
//!
//! The decision itself ([`resolve_placement`]) is pure; the two wrappers
//! apply it to a guest destination (push) or a local destination (pull).

use crate::error::CopyError;
use crate::protocol_core::{join_slash, sanitize_local_path, slash_basename};
use serde::Deserialize;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Existence and type of one copy endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointStat {
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub is_symlink: bool,
}

impl EndpointStat {
    pub fn missing() -> Self {
        EndpointStat::default()
    }

    /// Stat a local path, following symlinks. A missing path (or a dangling
    /// symlink) is not an error.
    pub fn of_local(path: &Path) -> std::io::Result<Self> {
        let not_found = |e: &std::io::Error| e.kind() == std::io::ErrorKind::NotFound;
        let link = match std::fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(e) if not_found(&e) => return Ok(EndpointStat::missing()),
            Err(e) => return Err(e),
        };
        let is_symlink = link.file_type().is_symlink();
        let md = if is_symlink {
            match std::fs::metadata(path) {
                Ok(md) => md,
                Err(e) if not_found(&e) => return Ok(EndpointStat::missing()),
                Err(e) => return Err(e),
            }
        } else {
            link
        };
        Ok(EndpointStat {
            exists: true,
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            is_symlink,
        })
    }
}

/// Where the source lands relative to the requested destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Use the destination path verbatim
    AsIs,
    /// Nest the source under the destination using its basename
    IntoDir,
}

/// Apply the copy rules to one source/destination pair.
///
/// | source | destination            | result                         |
/// |--------|------------------------|--------------------------------|
/// | file   | missing, trailing `/`  | error                          |
/// | file   | missing                | as is                          |
/// | file   | directory              | into dir                       |
/// | file   | file                   | as is (overwrite)              |
/// | dir    | file                   | error                          |
/// | dir    | missing                | as is (created)                |
/// | dir    | directory, `/.` source | as is (contents only)          |
/// | dir    | directory              | into dir                       |
pub fn resolve_placement(
    src_is_dir: bool,
    contents_only: bool,
    dst: EndpointStat,
    dst_trailing_slash: bool,
    dst_display: &str,
) -> Result<Placement, CopyError> {
    if !src_is_dir {
        if !dst.exists {
            if dst_trailing_slash {
                return Err(CopyError::DestinationDirMissing(dst_display.to_string()));
            }
            return Ok(Placement::AsIs);
        }
        if dst.is_dir {
            return Ok(Placement::IntoDir);
        }
        return Ok(Placement::AsIs);
    }

    if dst.exists && !dst.is_dir {
        return Err(CopyError::DirectoryOntoFile);
    }
    if !dst.exists || contents_only {
        return Ok(Placement::AsIs);
    }
    Ok(Placement::IntoDir)
}

/// Strip a trailing contents-only marker (`/.`) from a source path.
///
/// Local sources accept the platform separator as well as `/`; guest sources
/// only use `/`.
pub fn split_contents_only(path: &str, local: bool) -> (&str, bool) {
    if let Some(stripped) = path.strip_suffix("/.") {
        return (stripped, true);
    }
    if local && MAIN_SEPARATOR != '/' {
        let marker = format!("{}.", MAIN_SEPARATOR);
        if let Some(stripped) = path.strip_suffix(marker.as_str()) {
            return (stripped, true);
        }
    }
    (path, false)
}

/// True when the path asks for "into a directory"
pub fn has_trailing_separator(path: &str, local: bool) -> bool {
    path.ends_with('/') || (local && path.ends_with(MAIN_SEPARATOR))
}

fn local_basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| slash_basename(path).to_string())
}

/// Final guest path for a push of `src_local` to `dst_guest`.
pub fn resolve_push_destination(
    src_local: &str,
    src_is_dir: bool,
    dst_guest: &str,
    dst_stat: EndpointStat,
) -> Result<String, CopyError> {
    let (src, contents_only) = split_contents_only(src_local, true);
    let trailing = has_trailing_separator(dst_guest, false);
    match resolve_placement(src_is_dir, contents_only, dst_stat, trailing, dst_guest)? {
        Placement::AsIs => Ok(dst_guest.to_string()),
        Placement::IntoDir => Ok(join_slash(dst_guest, &local_basename(src))),
    }
}

/// Final local path for a pull of `src_guest` to `dst_local`.
pub fn resolve_pull_destination(
    src_guest: &str,
    src_is_dir: bool,
    dst_local: &Path,
    dst_stat: EndpointStat,
) -> Result<PathBuf, CopyError> {
    let (src, contents_only) = split_contents_only(src_guest, false);
    let dst_str = dst_local.to_string_lossy();
    let trailing = has_trailing_separator(&dst_str, true);
    match resolve_placement(src_is_dir, contents_only, dst_stat, trailing, &dst_str)? {
        Placement::AsIs => Ok(dst_local.to_path_buf()),
        Placement::IntoDir => match slash_basename(src) {
            // The guest root has no name of its own
            "/" | "." | "" => Ok(dst_local.to_path_buf()),
            base => sanitize_local_path(dst_local, base),
        },
    }
}
