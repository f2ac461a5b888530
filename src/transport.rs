//! Persistent bidirectional message channel to an instance endpoint
//!
//! Every copy entry and every exec session opens its own websocket; control
//! messages are JSON text frames and payload is binary frames.

use crate::config::Config;
use crate::error::CopyError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Opens a fresh connection to one instance endpoint.
#[async_trait]
pub trait Dial: Send + Sync {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self) -> Result<WebSocketStream<Self::Io>>;
}

/// Dials `ws(s)://…/instances/{id}/{endpoint}` with bearer authentication
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: Url,
    authorization: String,
}

impl WsDialer {
    pub fn new(config: &Config, instance_id: &str, endpoint: &str) -> Result<Self> {
        Ok(WsDialer {
            url: config.websocket_url(instance_id, endpoint)?,
            authorization: config.bearer(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Dial for WsDialer {
    type Io = MaybeTlsStream<TcpStream>;

    async fn dial(&self) -> Result<WebSocketStream<Self::Io>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("build websocket request")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.authorization).context("invalid API key")?,
        );

        match connect_async(request).await {
            Ok((ws, _response)) => Ok(ws),
            Err(tungstenite::Error::Http(response)) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Err(CopyError::Handshake {
                    status: response.status().as_u16(),
                    body,
                }
                .into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("websocket connect failed")),
        }
    }
}

/// Send one JSON control frame
pub async fn send_control<S, T>(sink: &mut S, msg: &T) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    T: Serialize + ?Sized,
{
    let text = serde_json::to_string(msg).context("encode control message")?;
    sink.send(Message::Text(text.into()))
        .await
        .context("send control message")
}

/// Send one binary payload frame
pub async fn send_payload<S>(sink: &mut S, data: Bytes) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(data))
        .await
        .context("send data")
}

/// How the peer ended the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// Normal closure, going away, or the connection dropped without a close
    /// handshake
    Expected,
    /// Closed with any other code
    Unexpected { code: u16, reason: String },
}

impl Closure {
    pub fn from_frame(frame: Option<&tungstenite::protocol::CloseFrame>) -> Self {
        match frame {
            None => Closure::Expected,
            Some(f) => match f.code {
                CloseCode::Normal | CloseCode::Away | CloseCode::Abnormal => Closure::Expected,
                code => Closure::Unexpected {
                    code: u16::from(code),
                    reason: f.reason.as_str().to_string(),
                },
            },
        }
    }

    /// Classify a read error: `Some` when it is a closure rather than a fault.
    pub fn from_error(err: &tungstenite::Error) -> Option<Self> {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Some(Closure::Expected)
            }
            tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ) => Some(Closure::Expected),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<(), CopyError> {
        match self {
            Closure::Expected => Ok(()),
            Closure::Unexpected { code, reason } => Err(CopyError::Closed { code, reason }),
        }
    }
}
