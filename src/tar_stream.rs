//! Tar streaming between stdio and the transfer protocol
//!
//! The tar side always runs on a blocking thread and talks to the async
//! transfer code over a bounded channel, so a slow pipe never stalls the
//! websocket and vice versa.

use crate::logger::{warn_skipped, Logger};
use crate::protocol::{FileHeader, TransferRequest, CHUNK_SIZE};
use crate::protocol_core::{clean_entry_name, sanitize_entry_path};
use crate::sink::EntrySink;
use crate::transfer::{pull, push_one, TransferOptions, TransferStats};
use crate::transport::Dial;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};
use std::time::Instant;
use tar::{Archive, Builder, EntryType, Header};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Chunks in flight between the tar thread and the connection
const CHANNEL_DEPTH: usize = 64;

enum TarEvent {
    Dir(Header, String),
    Symlink(Header, String, String),
    File(Header, String),
    Data(Bytes),
    EndOfEntry,
    Finish,
}

/// Feeds one regular file's payload from the channel into the tar builder.
struct EntryReader<'a> {
    rx: &'a mut mpsc::Receiver<TarEvent>,
    buf: Bytes,
    done: bool,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.buf.is_empty() {
                let n = self.buf.len().min(out.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.advance(n);
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(TarEvent::Data(chunk)) => self.buf = chunk,
                Some(TarEvent::EndOfEntry) => self.done = true,
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "entry ended without end marker",
                    ))
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transfer aborted mid-entry",
                    ))
                }
            }
        }
    }
}

/// Store `name` verbatim in the ustar name field so directory entries keep
/// their trailing slash. Returns false when the name does not fit.
fn set_raw_name(header: &mut Header, name: &str) -> bool {
    let slot = &mut header.as_old_mut().name;
    let bytes = name.as_bytes();
    if bytes.len() > slot.len() {
        return false;
    }
    slot.fill(0);
    slot[..bytes.len()].copy_from_slice(bytes);
    true
}

fn write_archive<W: Write>(mut rx: mpsc::Receiver<TarEvent>, out: W) -> Result<W> {
    let mut builder = Builder::new(out);

    while let Some(event) = rx.blocking_recv() {
        match event {
            TarEvent::Dir(mut header, name) => {
                if set_raw_name(&mut header, &name) {
                    header.set_cksum();
                    builder
                        .append(&header, io::empty())
                        .with_context(|| format!("write tar dir header {}", name))?;
                } else {
                    builder
                        .append_data(&mut header, &name, io::empty())
                        .with_context(|| format!("write tar dir header {}", name))?;
                }
            }
            TarEvent::Symlink(mut header, name, target) => {
                builder
                    .append_link(&mut header, &name, &target)
                    .with_context(|| format!("write tar symlink header {}", name))?;
            }
            TarEvent::File(mut header, name) => {
                let mut reader = EntryReader {
                    rx: &mut rx,
                    buf: Bytes::new(),
                    done: false,
                };
                builder
                    .append_data(&mut header, &name, &mut reader)
                    .with_context(|| format!("write tar data {}", name))?;
            }
            TarEvent::Data(_) | TarEvent::EndOfEntry => {
                bail!("payload outside of a file entry")
            }
            TarEvent::Finish => {
                let mut out = builder.into_inner().context("write tar trailer")?;
                out.flush().context("flush tar output")?;
                return Ok(out);
            }
        }
    }
    bail!("archive stream ended before completion")
}

/// Serializes pulled entries into a tar stream on `W`.
pub struct TarSink<W: Write + Send + 'static> {
    tx: Option<mpsc::Sender<TarEvent>>,
    writer: Option<JoinHandle<Result<W>>>,
    output: Option<W>,
    archive: bool,
    in_file: bool,
}

impl<W: Write + Send + 'static> TarSink<W> {
    pub fn new(out: W, archive: bool) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let writer = tokio::task::spawn_blocking(move || write_archive(rx, out));
        TarSink {
            tx: Some(tx),
            writer: Some(writer),
            output: None,
            archive,
            in_file: false,
        }
    }

    /// The underlying writer, available once `finish` has succeeded.
    pub fn take_output(&mut self) -> Option<W> {
        self.output.take()
    }

    fn header_for(&self, entry: &FileHeader, kind: EntryType) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(entry.permissions());
        header.set_mtime(entry.mtime.max(0) as u64);
        let (uid, gid) = entry.ownership(self.archive).unwrap_or((0, 0));
        header.set_uid(uid as u64);
        header.set_gid(gid as u64);
        header.set_size(if kind == EntryType::Regular { entry.size } else { 0 });
        header
    }

    /// Collect the writer thread's result; used when the channel is gone.
    async fn join_writer(&mut self) -> Result<()> {
        self.tx = None;
        let Some(writer) = self.writer.take() else {
            bail!("archive writer already finished");
        };
        let out = writer.await.context("archive writer panicked")??;
        self.output = Some(out);
        Ok(())
    }

    async fn send(&mut self, event: TarEvent) -> Result<()> {
        let sent = match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        self.join_writer().await?;
        Err(anyhow!("archive writer stopped"))
    }
}

#[async_trait]
impl<W: Write + Send + 'static> EntrySink for TarSink<W> {
    async fn begin_entry(&mut self, entry: &FileHeader) -> Result<()> {
        self.end_entry().await?;
        let name = clean_entry_name(&entry.path)?;

        let event = if entry.is_dir {
            TarEvent::Dir(self.header_for(entry, EntryType::Directory), format!("{}/", name))
        } else if entry.is_symlink {
            TarEvent::Symlink(
                self.header_for(entry, EntryType::Symlink),
                name,
                entry.link_target.clone(),
            )
        } else {
            self.in_file = true;
            TarEvent::File(self.header_for(entry, EntryType::Regular), name)
        };
        self.send(event).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send(TarEvent::Data(Bytes::copy_from_slice(data))).await
    }

    async fn end_entry(&mut self) -> Result<()> {
        if !self.in_file {
            return Ok(());
        }
        self.in_file = false;
        self.send(TarEvent::EndOfEntry).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.end_entry().await?;
        self.send(TarEvent::Finish).await?;
        self.join_writer().await
    }
}

/// Pull `src_guest` and write it to `out` as a tar stream.
pub async fn pull_to_writer<D, W>(
    dialer: &D,
    src_guest: &str,
    opts: TransferOptions,
    out: W,
    logger: &dyn Logger,
) -> Result<(TransferStats, W)>
where
    D: Dial,
    W: Write + Send + 'static,
{
    let start = Instant::now();
    logger.start(src_guest, "-");

    let mut ws = dialer.dial().await?;
    let mut sink = TarSink::new(out, opts.archive);
    let stats = pull(&mut ws, src_guest, opts.follow_links, &mut sink, logger).await;
    let _ = ws.close(None).await;
    let stats = stats
        .with_context(|| format!("copy from {}", src_guest))
        .inspect_err(|e| logger.error("pull", src_guest, &format!("{:#}", e)))?;

    let out = sink
        .take_output()
        .ok_or_else(|| anyhow!("archive writer produced no output"))?;
    logger.done(stats.entries, stats.bytes, start.elapsed().as_secs_f64());
    Ok((stats, out))
}

struct ArchiveMeta {
    name: String,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
}

enum ArchiveEvent {
    Dir(ArchiveMeta),
    File(ArchiveMeta),
    Chunk(Bytes),
    EndOfEntry,
    Symlink { name: String, target: String },
    Unsupported { name: String, kind: &'static str },
}

fn read_archive<R: Read>(input: R, tx: mpsc::Sender<ArchiveEvent>) -> Result<()> {
    let mut archive = Archive::new(input);
    for entry in archive.entries().context("read tar archive")? {
        let mut entry = entry.context("read tar header")?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let header = entry.header();
        let kind = header.entry_type();
        let meta = ArchiveMeta {
            name: name.clone(),
            mode: header.mode().unwrap_or(0o644) & 0o7777,
            uid: header.uid().unwrap_or(0) as u32,
            gid: header.gid().unwrap_or(0) as u32,
            size: entry.size(),
        };

        let event = match kind {
            EntryType::Directory => ArchiveEvent::Dir(meta),
            EntryType::Regular | EntryType::Continuous => {
                if tx.blocking_send(ArchiveEvent::File(meta)).is_err() {
                    return Ok(());
                }
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let n = entry
                        .read(&mut buf)
                        .with_context(|| format!("read tar data {}", name))?;
                    if n == 0 {
                        break;
                    }
                    if tx
                        .blocking_send(ArchiveEvent::Chunk(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                ArchiveEvent::EndOfEntry
            }
            EntryType::Symlink => ArchiveEvent::Symlink {
                target: entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default(),
                name,
            },
            EntryType::Link => ArchiveEvent::Unsupported { name, kind: "hard link" },
            _ => ArchiveEvent::Unsupported {
                name,
                kind: "unsupported entry type",
            },
        };
        if tx.blocking_send(event).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Async view of one file's chunks on the archive channel.
struct EntryBody<'a> {
    rx: &'a mut mpsc::Receiver<ArchiveEvent>,
    pending: Bytes,
    done: bool,
}

impl AsyncRead for EntryBody<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(ArchiveEvent::Chunk(chunk)) => this.pending = chunk,
                Some(ArchiveEvent::EndOfEntry) => this.done = true,
                Some(_) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "archive entry ended early",
                    )))
                }
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive reader stopped mid-entry",
                    )))
                }
            }
        }
    }
}

async fn drive_push<D: Dial>(
    dialer: &D,
    rx: &mut mpsc::Receiver<ArchiveEvent>,
    dst_guest: &str,
    archive: bool,
    logger: &dyn Logger,
) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    let owner = |meta: &ArchiveMeta| if archive { (meta.uid, meta.gid) } else { (0, 0) };

    while let Some(event) = rx.recv().await {
        match event {
            ArchiveEvent::Dir(meta) => {
                let target = sanitize_entry_path(dst_guest, &meta.name)?;
                let (uid, gid) = owner(&meta);
                let request = TransferRequest::To {
                    guest_path: target.clone(),
                    is_dir: true,
                    mode: meta.mode,
                    follow_links: false,
                    uid,
                    gid,
                };
                push_one::<D, tokio::io::Empty>(dialer, &request, None)
                    .await
                    .with_context(|| format!("create directory {}", target))?;
                stats.entries += 1;
                logger.entry_done(&target, 0);
            }
            ArchiveEvent::File(meta) => {
                let target = sanitize_entry_path(dst_guest, &meta.name)?;
                let (uid, gid) = owner(&meta);
                let request = TransferRequest::To {
                    guest_path: target.clone(),
                    is_dir: false,
                    mode: meta.mode,
                    follow_links: false,
                    uid,
                    gid,
                };
                let mut body = EntryBody {
                    rx: &mut *rx,
                    pending: Bytes::new(),
                    done: false,
                };
                push_one(dialer, &request, Some(&mut body))
                    .await
                    .with_context(|| format!("copy file {}", target))?;
                stats.entries += 1;
                stats.bytes += meta.size;
                logger.entry_done(&target, meta.size);
            }
            ArchiveEvent::Symlink { name, target } => {
                warn_skipped(logger, &format!("{} -> {}", name, target), "symlink");
            }
            ArchiveEvent::Unsupported { name, kind } => warn_skipped(logger, &name, kind),
            ArchiveEvent::Chunk(_) | ArchiveEvent::EndOfEntry => {
                bail!("archive payload outside of a file entry")
            }
        }
    }
    Ok(stats)
}

/// Read a tar stream from `input` and recreate its entries under `dst_guest`.
///
/// Directories and regular files each go over their own connection in
/// archive order. Symlinks and other entry types are skipped with a warning.
pub async fn push_from_reader<D, R>(
    dialer: &D,
    input: R,
    dst_guest: &str,
    archive: bool,
    logger: &dyn Logger,
) -> Result<TransferStats>
where
    D: Dial,
    R: Read + Send + 'static,
{
    let start = Instant::now();
    logger.start("-", dst_guest);

    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
    let reader = tokio::task::spawn_blocking(move || read_archive(input, tx));

    let pushed = drive_push(dialer, &mut rx, dst_guest, archive, logger).await;
    drop(rx);
    let read = reader.await.context("archive reader panicked")?;

    // A tar read failure explains a truncated entry better than the push error
    let stats = match (pushed, read) {
        (_, Err(read_err)) => return Err(read_err),
        (Err(push_err), Ok(())) => return Err(push_err),
        (Ok(stats), Ok(())) => stats,
    };
    logger.done(stats.entries, stats.bytes, start.elapsed().as_secs_f64());
    Ok(stats)
}
