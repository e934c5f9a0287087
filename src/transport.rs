//! Transport seam: text frames over a bidirectional connection.
//!
//! The relay machinery only sees these traits; production uses
//! [`WsTransport`] (tokio-tungstenite), tests use the in-memory transport
//! from the `testing` module.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};
use crate::relay::RelayUrl;

/// Connects to relay endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection, returning its send and receive halves.
    async fn connect(&self, url: &RelayUrl)
    -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

/// Send half of a connection.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    async fn close(&mut self);
}

/// Receive half of a connection. `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait TransportStream: Send {
    async fn recv(&mut self) -> Result<Option<String>>;
}

type WsConnection = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport (TLS via rustls with webpki roots).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &RelayUrl,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((
            Box::new(WsSink { inner: sink }),
            Box::new(WsStream { inner: stream }),
        ))
    }
}

struct WsSink {
    inner: futures::stream::SplitSink<WsConnection, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|e| Error::TransportIo(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

struct WsStream {
    inner: futures::stream::SplitStream<WsConnection>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::TransportIo(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pings are answered by tungstenite itself; binary frames are
                // not part of the protocol.
                Some(Ok(_)) => continue,
            }
        }
    }
}
