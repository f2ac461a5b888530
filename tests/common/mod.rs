#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use hypeman::transport::Dial;
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, DuplexStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerWs = WebSocketStream<DuplexStream>;
type Handler = Arc<dyn Fn(ServerWs) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-memory instance endpoint: every dial spawns `handler` on the server
/// half of a fresh duplex pipe.
pub struct DuplexDialer {
    handler: Handler,
    dials: Arc<AtomicUsize>,
}

impl DuplexDialer {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        DuplexDialer {
            handler: Arc::new(move |ws| handler(ws).boxed()),
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dial for DuplexDialer {
    type Io = DuplexStream;

    async fn dial(&self) -> Result<WebSocketStream<DuplexStream>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1 << 20);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
            handler(ws).await;
        });
        Ok(WebSocketStream::from_raw_socket(client, Role::Client, None).await)
    }
}

/// Read the first text frame of a connection as JSON.
pub async fn read_request(ws: &mut ServerWs) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).ok();
        }
    }
    None
}

/// Drain frames until the client goes away.
pub async fn drain(ws: &mut ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

pub async fn send_json(ws: &mut ServerWs, value: Value) {
    let _ = ws.send(Message::text(value.to_string())).await;
}

/// One entry as received by the fake `cp` endpoint
#[derive(Debug, Clone)]
pub struct Pushed {
    pub request: Value,
    pub data: Vec<u8>,
}

pub type PushLog = Arc<Mutex<Vec<Pushed>>>;

/// Fake "to" side: records the request and payload, then answers with
/// `reply(request, payload_len)`.
pub fn push_server<R>(log: PushLog, reply: R) -> DuplexDialer
where
    R: Fn(&Value, usize) -> Value + Send + Sync + 'static,
{
    let reply = Arc::new(reply);
    DuplexDialer::new(move |mut ws| {
        let log = log.clone();
        let reply = reply.clone();
        async move {
            let Some(request) = read_request(&mut ws).await else {
                return;
            };
            let mut data = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(chunk) => data.extend_from_slice(&chunk),
                    Message::Text(text) => {
                        let v: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
                        if v["type"] == "end" {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let answer = reply(&request, data.len());
            log.lock().unwrap().push(Pushed { request, data });
            send_json(&mut ws, answer).await;
            drain(&mut ws).await;
        }
    })
}

pub fn accept_all(_request: &Value, len: usize) -> Value {
    json!({"type": "result", "success": true, "bytes_written": len})
}

/// Fake "from" side: records the request, plays back `frames` and closes.
pub fn pull_server(requests: Arc<Mutex<Vec<Value>>>, frames: Vec<Message>) -> DuplexDialer {
    DuplexDialer::new(move |mut ws| {
        let requests = requests.clone();
        let frames = frames.clone();
        async move {
            let Some(request) = read_request(&mut ws).await else {
                return;
            };
            requests.lock().unwrap().push(request);
            for frame in frames {
                if ws.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = ws.close(None).await;
            drain(&mut ws).await;
        }
    })
}

pub fn header(value: Value) -> Message {
    let mut obj = json!({"type": "header"});
    if let (Some(dst), Some(src)) = (obj.as_object_mut(), value.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    Message::text(obj.to_string())
}

pub fn end(is_final: bool) -> Message {
    Message::text(json!({"type": "end", "final": is_final}).to_string())
}

pub fn error_frame(message: &str, path: &str) -> Message {
    Message::text(json!({"type": "error", "message": message, "path": path}).to_string())
}

pub fn payload(data: &[u8]) -> Message {
    Message::binary(data.to_vec())
}

/// Deterministic test content
pub fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// AsyncWrite that collects everything into a shared buffer
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// AsyncWrite whose writes always fail with the given kind
pub struct FailingWriter(pub io::ErrorKind);

impl AsyncWrite for FailingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(self.0, "write failed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
