//! Exec session client for the instance `exec` endpoint
//!
//! One connection per session. After the request, stdin is forwarded as
//! binary frames while binary frames from the server go to stdout; a JSON
//! `{"exitCode": N}` frame ends the session.

use crate::logger::debug;
use crate::protocol::{ControlMessage, ExecRequest, CHUNK_SIZE, EXIT_FAULT, EXIT_INTERRUPTED};
use crate::protocol_core::decode_control;
use crate::terminal::RawModeGuard;
use crate::transfer::FrameChannel;
use crate::transport::{send_control, send_payload, Closure, Dial};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// How a session ended
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// Local fault that forced [`EXIT_FAULT`]
    pub error: Option<anyhow::Error>,
}

impl ExecOutcome {
    fn exited(exit_code: i32) -> Self {
        ExecOutcome {
            exit_code,
            error: None,
        }
    }

    fn fault(err: anyhow::Error) -> Self {
        ExecOutcome {
            exit_code: EXIT_FAULT,
            error: Some(err),
        }
    }

    fn interrupted() -> Self {
        ExecOutcome::exited(EXIT_INTERRUPTED)
    }
}

enum Completion {
    Exit(i32),
    Failed(anyhow::Error),
}

/// Parse `KEY=VALUE` pairs; malformed entries are skipped with a warning.
pub fn parse_env(vars: &[String]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for var in vars {
        match var.split_once('=') {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => eprintln!("Warning: ignoring malformed env var: {}", var),
        }
    }
    env
}

/// Assemble the wire request; a zero timeout means none.
pub fn build_request(
    command: Vec<String>,
    tty: bool,
    env: &[String],
    cwd: Option<String>,
    timeout_seconds: u32,
) -> ExecRequest {
    ExecRequest {
        command,
        tty,
        env: parse_env(env),
        cwd: cwd.filter(|c| !c.is_empty()),
        timeout_seconds: (timeout_seconds > 0).then_some(timeout_seconds),
    }
}

/// Drive one session on an open connection.
///
/// The first of these wins: a forwarding fault (255), an exit message or a
/// clean close (its code, or 0), or `cancel` resolving (130). Neither
/// forwarding task is awaited after the outcome is known.
pub async fn run_session<C, R, W, F>(
    mut ws: C,
    request: &ExecRequest,
    mut stdin: R,
    mut stdout: W,
    cancel: F,
) -> ExecOutcome
where
    C: FrameChannel + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    if let Err(e) = send_control(&mut ws, request)
        .await
        .context("failed to send exec request")
    {
        return ExecOutcome::fault(e);
    }
    debug(|| format!("exec {:?} tty={}", request.command, request.tty));

    let (mut sink, mut stream) = ws.split();
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

    let input_done = done_tx.clone();
    let input = tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match stdin.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("stdin read error");
                    let _ = input_done.send(Completion::Failed(err)).await;
                    return;
                }
            };
            if let Err(e) = send_payload(&mut sink, Bytes::copy_from_slice(&buf[..n])).await {
                let _ = input_done.send(Completion::Failed(e)).await;
                return;
            }
        }
    });

    let output = tokio::spawn(async move {
        let completion = loop {
            match stream.next().await {
                None => break Completion::Exit(0),
                Some(Ok(Message::Binary(data))) => {
                    let written = async {
                        stdout.write_all(&data).await?;
                        stdout.flush().await
                    };
                    match written.await {
                        Ok(()) => {}
                        // Reader went away (`exec ... | head`)
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                            debug(|| "stdout closed, ending session".to_string());
                            break Completion::Exit(0);
                        }
                        Err(e) => {
                            break Completion::Failed(
                                anyhow::Error::new(e).context("stdout write error"),
                            );
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => match decode_control(text.as_str()) {
                    Ok(ControlMessage::Exit(exit)) => break Completion::Exit(exit.exit_code),
                    Ok(other) => debug(|| format!("ignoring {} message", other.kind())),
                    Err(e) => debug(|| format!("ignoring text frame: {}", e)),
                },
                Some(Ok(Message::Close(frame))) => {
                    break match Closure::from_frame(frame.as_ref()).into_result() {
                        Ok(()) => Completion::Exit(0),
                        Err(e) => Completion::Failed(e.into()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    break match Closure::from_error(&e) {
                        Some(closure) => match closure.into_result() {
                            Ok(()) => Completion::Exit(0),
                            Err(err) => Completion::Failed(err.into()),
                        },
                        None => Completion::Failed(
                            anyhow::Error::new(e).context("websocket read error"),
                        ),
                    };
                }
            }
        };
        let _ = done_tx.send(completion).await;
    });

    let outcome = tokio::select! {
        done = done_rx.recv() => match done {
            Some(Completion::Exit(code)) => ExecOutcome::exited(code),
            Some(Completion::Failed(err)) => ExecOutcome::fault(err),
            None => ExecOutcome::exited(0),
        },
        _ = cancel => ExecOutcome::interrupted(),
    };

    input.abort();
    output.abort();
    outcome
}

/// Resolves on Ctrl-C, and on SIGTERM where supported.
pub async fn interrupt_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Connect and run an exec session against the process stdio.
pub async fn run<D: Dial>(dialer: &D, request: &ExecRequest) -> Result<ExecOutcome> {
    let ws = dialer.dial().await?;
    let guard = RawModeGuard::acquire(request.tty)?;
    let outcome = run_session(
        ws,
        request,
        tokio::io::stdin(),
        tokio::io::stdout(),
        interrupt_signal(),
    )
    .await;
    drop(guard);
    Ok(outcome)
}
