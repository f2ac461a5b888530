//! Parsing of `instance:/path` copy arguments

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub kind: EndpointKind,
    pub instance: Option<String>,
    pub path: String,
}

impl PathSpec {
    pub fn local(path: &str) -> Self {
        PathSpec {
            kind: EndpointKind::Local,
            instance: None,
            path: path.to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind == EndpointKind::Remote
    }

    /// A bare `-` stands for the local standard input/output stream.
    pub fn is_stdio(&self) -> bool {
        self.kind == EndpointKind::Local && self.path == "-"
    }
}

/// Parse a user-supplied copy argument.
///
/// Absolute, `./`, `../`, `~` and Windows drive paths are always local. A
/// colon with no path separator before it splits `instance:path`; use
/// `./name:with:colons` for local files with colons in their name.
pub fn parse_path_spec(arg: &str) -> PathSpec {
    if arg.starts_with('/')
        || arg.starts_with("./")
        || arg.starts_with("../")
        || arg.starts_with('~')
        || arg == "."
        || arg == ".."
        || is_windows_drive_path(arg)
    {
        return PathSpec::local(arg);
    }

    match arg.find(':') {
        Some(idx) if idx > 0 => {
            let instance = &arg[..idx];
            if instance.contains(&['/', '\\'][..]) {
                return PathSpec::local(arg);
            }
            PathSpec {
                kind: EndpointKind::Remote,
                instance: Some(instance.to_string()),
                path: arg[idx + 1..].to_string(),
            }
        }
        _ => PathSpec::local(arg),
    }
}

fn is_windows_drive_path(arg: &str) -> bool {
    let bytes = arg.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Parse both copy arguments and enforce that exactly one side is remote.
pub fn parse_copy_pair(src: &str, dst: &str) -> Result<(PathSpec, PathSpec)> {
    let src = parse_path_spec(src);
    let dst = parse_path_spec(dst);
    match (src.is_remote(), dst.is_remote()) {
        (true, true) => bail!("cannot copy between two instances; one path must be local"),
        (false, false) => {
            bail!("at least one path must reference an instance (use instance:/path format)")
        }
        _ => Ok((src, dst)),
    }
}
