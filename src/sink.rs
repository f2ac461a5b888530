//! Destinations for pulled entries
//!
//! A pull drives an [`EntrySink`] with one `begin_entry` per header, payload
//! writes for regular files and an `end_entry` once the entry is complete.
//! `finish` runs after the final end marker.

use crate::protocol::FileHeader;
use crate::protocol_core::sanitize_local_path;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait EntrySink: Send {
    async fn begin_entry(&mut self, header: &FileHeader) -> Result<()>;
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn end_entry(&mut self) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

struct OpenFile {
    file: File,
    path: PathBuf,
    header: FileHeader,
}

/// Writes pulled entries below a local destination.
///
/// Header paths are relative to the pulled source root. When the source is a
/// single file, `root` is the file itself and every regular entry lands there.
pub struct FsSink {
    root: PathBuf,
    root_is_file: bool,
    archive: bool,
    open: Option<OpenFile>,
    dirs: Vec<(PathBuf, FileHeader)>,
}

impl FsSink {
    pub fn new(root: PathBuf, root_is_file: bool, archive: bool) -> Self {
        FsSink {
            root,
            root_is_file,
            archive,
            open: None,
            dirs: Vec::new(),
        }
    }

    fn target(&self, header: &FileHeader) -> Result<PathBuf> {
        if self.root_is_file && header.is_regular() {
            return Ok(self.root.clone());
        }
        Ok(sanitize_local_path(&self.root, &header.path)?)
    }

    fn apply_ownership(&self, path: &Path, header: &FileHeader, follow: bool) {
        if let Some((uid, gid)) = header.ownership(self.archive) {
            if let Err(e) = chown(path, uid, gid, follow) {
                eprintln!(
                    "Warning: cannot set owner {}:{} on {}: {}",
                    uid,
                    gid,
                    path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(unix)]
fn chown(path: &Path, uid: u32, gid: u32, follow: bool) -> std::io::Result<()> {
    if follow {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
    } else {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }
}

#[cfg(not(unix))]
fn chown(_path: &Path, _uid: u32, _gid: u32, _follow: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

fn set_mtime(path: &Path, mtime: i64) -> std::io::Result<()> {
    if mtime <= 0 {
        return Ok(());
    }
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0))
}

#[async_trait]
impl EntrySink for FsSink {
    async fn begin_entry(&mut self, header: &FileHeader) -> Result<()> {
        self.end_entry().await?;
        let target = self.target(header)?;

        if header.is_dir {
            fs::create_dir_all(&target)
                .await
                .with_context(|| format!("create directory {}", target.display()))?;
            self.apply_ownership(&target, header, true);
            self.dirs.push((target, header.clone()));
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        if header.is_symlink {
            #[cfg(unix)]
            {
                if fs::symlink_metadata(&target).await.is_ok() {
                    fs::remove_file(&target)
                        .await
                        .with_context(|| format!("replace {}", target.display()))?;
                }
                fs::symlink(&header.link_target, &target)
                    .await
                    .with_context(|| format!("create symlink {}", target.display()))?;
                self.apply_ownership(&target, header, false);
            }
            #[cfg(not(unix))]
            eprintln!(
                "Warning: skipping symlink {} -> {}",
                header.path, header.link_target
            );
            return Ok(());
        }

        let file = File::create(&target)
            .await
            .with_context(|| format!("create {}", target.display()))?;
        self.open = Some(OpenFile {
            file,
            path: target,
            header: header.clone(),
        });
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| anyhow!("payload without an open file"))?;
        open.file
            .write_all(data)
            .await
            .with_context(|| format!("write {}", open.path.display()))
    }

    async fn end_entry(&mut self) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        open.file
            .flush()
            .await
            .with_context(|| format!("flush {}", open.path.display()))?;
        drop(open.file);

        set_mode(&open.path, open.header.permissions())
            .with_context(|| format!("chmod {}", open.path.display()))?;
        self.apply_ownership(&open.path, &open.header, true);
        set_mtime(&open.path, open.header.mtime)
            .with_context(|| format!("set mtime on {}", open.path.display()))?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.end_entry().await?;
        // Deepest first, so restrictive parent modes don't block children
        for (dir, header) in self.dirs.drain(..).rev() {
            set_mode(&dir, header.permissions())
                .with_context(|| format!("chmod {}", dir.display()))?;
            set_mtime(&dir, header.mtime)
                .with_context(|| format!("set mtime on {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file(path: &str, size: u64, mode: u32) -> FileHeader {
        FileHeader {
            path: path.into(),
            mode,
            size,
            mtime: 1_600_000_000,
            ..Default::default()
        }
    }

    fn dir(path: &str, mode: u32) -> FileHeader {
        FileHeader {
            path: path.into(),
            mode,
            is_dir: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_tree_below_root() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("out");
        let mut sink = FsSink::new(root.clone(), false, false);

        sink.begin_entry(&dir(".", 0o755)).await.unwrap();
        sink.begin_entry(&dir("sub", 0o700)).await.unwrap();
        sink.begin_entry(&file("sub/a.txt", 5, 0o640)).await.unwrap();
        sink.write(b"hel").await.unwrap();
        sink.write(b"lo").await.unwrap();
        sink.end_entry().await.unwrap();
        sink.finish().await.unwrap();

        let a = root.join("sub/a.txt");
        assert_eq!(std::fs::read(&a).unwrap(), b"hello");
        let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&a).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode(&a), 0o640);
            assert_eq!(mode(&root.join("sub")), 0o700);
        }
    }

    #[tokio::test]
    async fn single_file_source_writes_root() {
        let tmp = tempdir().unwrap();
        let target = tmp.path().join("renamed.txt");
        let mut sink = FsSink::new(target.clone(), true, false);
        sink.begin_entry(&file("hosts", 2, 0o644)).await.unwrap();
        sink.write(b"ok").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn rejects_escaping_header() {
        let tmp = tempdir().unwrap();
        let mut sink = FsSink::new(tmp.path().join("out"), false, false);
        let err = sink
            .begin_entry(&file("../../etc/passwd", 1, 0o644))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path escapes destination"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recreates_symlinks() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("out");
        let mut sink = FsSink::new(root.clone(), false, false);
        sink.begin_entry(&dir(".", 0o755)).await.unwrap();
        let link = FileHeader {
            path: "current".into(),
            is_symlink: true,
            link_target: "releases/v2".into(),
            ..Default::default()
        };
        sink.begin_entry(&link).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(
            std::fs::read_link(root.join("current")).unwrap(),
            PathBuf::from("releases/v2")
        );
    }
}
