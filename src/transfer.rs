//! Transfer protocol client for the instance `cp` endpoint
//!
//! Push ("to"): one connection per entry. The request describes the single
//! target, file bytes follow as binary frames, an end marker closes the
//! payload and the server answers with exactly one result.
//!
//! Pull ("from"): one connection for the whole tree. The server streams
//! header / payload / end triples and finishes with a final end marker.

use crate::error::CopyError;
use crate::fs_enum::{enumerate_source, EntryKind};
use crate::logger::{debug, warn_skipped, Logger};
use crate::protocol::{
    ControlMessage, EndMarker, FileHeader, TransferRequest, TransferResult, TypedMessage,
    CHUNK_SIZE,
};
use crate::protocol_core::{decode_control, sanitize_entry_path};
use crate::sink::{EntrySink, FsSink};
use crate::transport::{send_control, send_payload, Closure, Dial};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::{self, Message};

/// Bidirectional frame channel; implemented by every `WebSocketStream`.
pub trait FrameChannel:
    Sink<Message, Error = tungstenite::Error>
    + Stream<Item = Result<Message, tungstenite::Error>>
    + Unpin
    + Send
{
}

impl<T> FrameChannel for T where
    T: Sink<Message, Error = tungstenite::Error>
        + Stream<Item = Result<Message, tungstenite::Error>>
        + Unpin
        + Send
{
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// Preserve uid/gid end to end
    pub archive: bool,
    pub follow_links: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Read the next frame, mapping a clean closure to `None`.
async fn next_frame<C: FrameChannel>(ws: &mut C) -> Result<Option<Message>> {
    match ws.next().await {
        None => Ok(None),
        Some(Ok(Message::Close(frame))) => {
            Closure::from_frame(frame.as_ref()).into_result()?;
            Ok(None)
        }
        Some(Ok(msg)) => Ok(Some(msg)),
        Some(Err(e)) => match Closure::from_error(&e) {
            Some(closure) => {
                closure.into_result()?;
                Ok(None)
            }
            None => Err(anyhow::Error::new(e).context("read message")),
        },
    }
}

/// Run the "to" exchange for one entry on an open connection.
///
/// `body` is streamed in [`CHUNK_SIZE`] frames; directories pass `None`.
pub async fn push_entry<C, R>(
    ws: &mut C,
    request: &TransferRequest,
    body: Option<&mut R>,
) -> Result<TransferResult>
where
    C: FrameChannel,
    R: AsyncRead + Unpin + Send + ?Sized,
{
    send_control(ws, request).await?;

    if let Some(reader) = body {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await.context("read source")?;
            if n == 0 {
                break;
            }
            send_payload(ws, Bytes::copy_from_slice(&buf[..n])).await?;
        }
    }

    send_control(ws, &TypedMessage::End(EndMarker { is_final: false })).await?;

    while let Some(msg) = next_frame(ws).await? {
        match msg {
            Message::Text(text) => match decode_control(text.as_str())? {
                ControlMessage::Result(result) => return Ok(result),
                ControlMessage::Error(e) => {
                    return Err(CopyError::Remote {
                        message: e.message,
                        path: e.path,
                    }
                    .into())
                }
                ControlMessage::Unknown => {}
                other => return Err(CopyError::UnexpectedMessage(other.kind().to_string()).into()),
            },
            Message::Binary(data) => {
                return Err(CopyError::PayloadOutsideFile { len: data.len() }.into())
            }
            _ => {}
        }
    }
    Err(CopyError::Incomplete.into())
}

/// Dial, push one entry, and fail unless the server reports success.
pub async fn push_one<D, R>(
    dialer: &D,
    request: &TransferRequest,
    body: Option<&mut R>,
) -> Result<TransferResult>
where
    D: Dial,
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut ws = dialer.dial().await?;
    debug(|| format!("push {:?}", request));
    let result = push_entry(&mut ws, request, body).await;
    let _ = ws.close(None).await;
    let result = result.with_context(|| format!("copy to {}", request.guest_path()))?;
    if !result.success {
        return Err(CopyError::Rejected(result.error.unwrap_or_default()).into());
    }
    Ok(result)
}

/// Push a local file or directory tree to an already resolved guest path.
///
/// Each walked entry goes over its own connection, parents first. With
/// `contents_only` the source root itself is only created when the
/// destination did not exist yet.
pub async fn push_path<D: Dial>(
    dialer: &D,
    src: &Path,
    dst_guest: &str,
    contents_only: bool,
    dst_existed: bool,
    opts: TransferOptions,
    logger: &dyn Logger,
) -> Result<TransferStats> {
    let start = Instant::now();
    logger.start(&src.display().to_string(), dst_guest);

    let entries = enumerate_source(src, opts.follow_links)?;
    let mut stats = TransferStats::default();

    for entry in entries {
        let target = sanitize_entry_path(dst_guest, &entry.relative)?;
        let (uid, gid) = if opts.archive {
            (entry.uid, entry.gid)
        } else {
            (0, 0)
        };

        match entry.kind {
            EntryKind::Symlink => {
                warn_skipped(logger, &entry.path.display().to_string(), "symlink");
                continue;
            }
            EntryKind::Directory => {
                if entry.relative == "." && contents_only && dst_existed {
                    continue;
                }
                let request = TransferRequest::To {
                    guest_path: target.clone(),
                    is_dir: true,
                    mode: entry.mode,
                    follow_links: opts.follow_links,
                    uid,
                    gid,
                };
                push_one::<D, tokio::fs::File>(dialer, &request, None)
                    .await
                    .inspect_err(|e| logger.error("push", &target, &format!("{:#}", e)))?;
            }
            EntryKind::File => {
                let mut file = tokio::fs::File::open(&entry.path)
                    .await
                    .with_context(|| format!("open {}", entry.path.display()))?;
                let request = TransferRequest::To {
                    guest_path: target.clone(),
                    is_dir: false,
                    mode: entry.mode,
                    follow_links: opts.follow_links,
                    uid,
                    gid,
                };
                let result = push_one(dialer, &request, Some(&mut file))
                    .await
                    .inspect_err(|e| logger.error("push", &target, &format!("{:#}", e)))?;
                stats.bytes += result.bytes_written.unwrap_or(entry.size);
            }
        }
        stats.entries += 1;
        logger.entry_done(&target, if entry.kind == EntryKind::File { entry.size } else { 0 });
    }

    logger.done(stats.entries, stats.bytes, start.elapsed().as_secs_f64());
    Ok(stats)
}

/// Tracks the entry currently being received on a pull.
#[derive(Default)]
struct PullState {
    current: Option<FileHeader>,
    received: u64,
    stats: TransferStats,
}

impl PullState {
    async fn close_entry<K: EntrySink + ?Sized>(
        &mut self,
        sink: &mut K,
        logger: &dyn Logger,
    ) -> Result<()> {
        let Some(header) = self.current.take() else {
            return Ok(());
        };
        if header.is_regular() && self.received != header.size {
            return Err(CopyError::SizeMismatch {
                path: header.path,
                expected: header.size,
                actual: self.received,
            }
            .into());
        }
        sink.end_entry().await?;
        self.stats.entries += 1;
        self.stats.bytes += self.received;
        logger.entry_done(&header.path, self.received);
        self.received = 0;
        Ok(())
    }
}

/// Run the "from" exchange on an open connection, feeding entries to `sink`.
pub async fn pull<C, K>(
    ws: &mut C,
    guest_path: &str,
    follow_links: bool,
    sink: &mut K,
    logger: &dyn Logger,
) -> Result<TransferStats>
where
    C: FrameChannel,
    K: EntrySink + ?Sized,
{
    let request = TransferRequest::From {
        guest_path: guest_path.to_string(),
        follow_links,
    };
    send_control(ws, &request).await?;

    let mut state = PullState::default();
    while let Some(msg) = next_frame(ws).await? {
        match msg {
            Message::Text(text) => match decode_control(text.as_str())? {
                ControlMessage::Header(header) => {
                    state.close_entry(sink, logger).await?;
                    debug(|| format!("header {} ({} bytes)", header.path, header.size));
                    sink.begin_entry(&header).await?;
                    state.current = Some(header);
                }
                ControlMessage::End(end) => {
                    state.close_entry(sink, logger).await?;
                    if end.is_final {
                        sink.finish().await?;
                        return Ok(state.stats);
                    }
                }
                ControlMessage::Error(e) => {
                    return Err(CopyError::Remote {
                        message: e.message,
                        path: e.path,
                    }
                    .into())
                }
                ControlMessage::Unknown => {}
                other => return Err(CopyError::UnexpectedMessage(other.kind().to_string()).into()),
            },
            Message::Binary(data) => {
                let Some(header) = state.current.as_ref().filter(|h| h.is_regular()) else {
                    return Err(CopyError::PayloadOutsideFile { len: data.len() }.into());
                };
                let received = state.received + data.len() as u64;
                if received > header.size {
                    return Err(CopyError::SizeMismatch {
                        path: header.path.clone(),
                        expected: header.size,
                        actual: received,
                    }
                    .into());
                }
                sink.write(&data).await?;
                state.received = received;
            }
            _ => {}
        }
    }
    Err(CopyError::Incomplete.into())
}

/// Pull `src_guest` into the local filesystem at the resolved `dst`.
pub async fn pull_path<D: Dial>(
    dialer: &D,
    src_guest: &str,
    dst: PathBuf,
    src_is_dir: bool,
    opts: TransferOptions,
    logger: &dyn Logger,
) -> Result<TransferStats> {
    let start = Instant::now();
    logger.start(src_guest, &dst.display().to_string());

    let mut ws = dialer.dial().await?;
    let mut sink = FsSink::new(dst, !src_is_dir, opts.archive);
    let stats = pull(&mut ws, src_guest, opts.follow_links, &mut sink, logger)
        .await
        .with_context(|| format!("copy from {}", src_guest));
    let _ = ws.close(None).await;
    let stats = stats.inspect_err(|e| logger.error("pull", src_guest, &format!("{:#}", e)))?;

    logger.done(stats.entries, stats.bytes, start.elapsed().as_secs_f64());
    Ok(stats)
}
