use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
// Local source enumeration for pushes (Unix focus)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// One local entry below a push source
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: PathBuf,
    /// Slash-separated path relative to the source root; `.` for the root
    pub relative: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[cfg(unix)]
fn ownership_and_mode(md: &std::fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (md.mode() & 0o7777, md.uid(), md.gid())
}

#[cfg(not(unix))]
fn ownership_and_mode(md: &std::fs::Metadata) -> (u32, u32, u32) {
    let mode = if md.is_dir() {
        0o755
    } else if md.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    (mode, 0, 0)
}

fn relative_slash(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Walk `root` in name order, parents before their children.
///
/// With `follow_links` symlinks are resolved and walked through; otherwise
/// they are reported as [`EntryKind::Symlink`]. The root itself is always
/// resolved. A file root yields exactly one entry.
pub fn enumerate_source(root: &Path, follow_links: bool) -> Result<Vec<LocalEntry>> {
    use walkdir::WalkDir;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(follow_links)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let md = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let kind = if entry.depth() > 0 && entry.path_is_symlink() && !follow_links {
            EntryKind::Symlink
        } else if md.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let (mode, uid, gid) = ownership_and_mode(&md);
        entries.push(LocalEntry {
            path: entry.path().to_path_buf(),
            relative: relative_slash(root, entry.path()),
            kind,
            size: if kind == EntryKind::File { md.len() } else { 0 },
            mode,
            uid,
            gid,
        });
    }
    Ok(entries)
}
