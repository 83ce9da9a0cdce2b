//! Socket transport for the delta stream.
//!
//! A transport turns a stream URL into a duplex channel of
//! [`StreamMessage`]s. The WebSocket implementation runs one writer task
//! (fed by an `mpsc` channel) and one reader task per socket; dropping
//! the outgoing sender closes the socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{DriverError, Result};
use crate::protocol::StreamMessage;

/// Frames buffered in each direction before senders wait.
pub const CHANNEL_CAPACITY: usize = 256;

/// Both halves of an open socket.
///
/// `incoming` yields `Err` for a frame that could not be decoded; the
/// channel closes when the socket does.
#[derive(Debug)]
pub struct SocketChannel {
    pub outgoing: mpsc::Sender<StreamMessage>,
    pub incoming: mpsc::Receiver<Result<StreamMessage>>,
}

/// Opens delta-stream sockets.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<SocketChannel>;
}

/// Map an HTTP(S) stream URL onto its WebSocket scheme.
pub fn socket_url(url: &Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url.clone()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(DriverError::Parse(format!(
                "unsupported delta stream scheme '{other}'"
            )))
        }
    };
    let mut mapped = url.clone();
    mapped
        .set_scheme(scheme)
        .map_err(|_| DriverError::Parse(format!("cannot map {url} to {scheme}")))?;
    Ok(mapped)
}

/// tokio-tungstenite transport with bincode binary frames.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<SocketChannel> {
        let url = socket_url(url)?;
        log::debug!("Opening delta stream socket {url}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<StreamMessage>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Result<StreamMessage>>(CHANNEL_CAPACITY);

        // Writer task: forward outgoing frames, close the socket once every
        // sender is gone.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable {} frame: {e}", frame.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode binary frames until the socket closes.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Binary(data)) => StreamMessage::decode(&data),
                    Ok(Message::Close(frame)) => {
                        log::debug!("Delta stream closed by peer: {frame:?}");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Delta stream read failed: {e}");
                        break;
                    }
                };
                if in_tx.send(decoded).await.is_err() {
                    break;
                }
            }
        });

        Ok(SocketChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
