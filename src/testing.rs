//! Test utilities: an in-memory transport whose relay side is driven by the
//! test, plus event fixtures.
//!
//! Each call to [`MemoryTransport::connect`] hands the test a fresh
//! [`ServerEnd`] through the receiver returned by [`MemoryTransport::new`],
//! so reconnects are observable as new server ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{Event, EventBuilder, EventId, Signature, kind};
use crate::filter::Filter;
use crate::keys::Keys;
use crate::relay::RelayUrl;
use crate::transport::{Transport, TransportSink, TransportStream};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel-backed transport for tests.
pub struct MemoryTransport {
    connections: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (connections, accept) = mpsc::unbounded_channel();
        (Arc::new(Self { connections }), accept)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        url: &RelayUrl,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server = ServerEnd {
            url: url.clone(),
            incoming: server_rx,
            outgoing: server_tx,
        };
        // A dropped acceptor means the test refuses further connections.
        self.connections
            .send(server)
            .map_err(|_| Error::TransportClosed)?;
        Ok((
            Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            Box::new(MemoryStream { rx: client_rx }),
        ))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| Error::TransportClosed),
            None => Err(Error::TransportClosed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// The relay side of one in-memory connection.
pub struct ServerEnd {
    url: RelayUrl,
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Next client frame within `wait`, if any.
    pub async fn try_frame(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.incoming.recv()).await {
            Ok(Some(frame)) => Some(serde_json::from_str(&frame).expect("client sent invalid JSON")),
            _ => None,
        }
    }

    /// Next client frame as parsed JSON; panics after five seconds.
    pub async fn expect_frame(&mut self) -> Value {
        let frame = tokio::time::timeout(EXPECT_TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        serde_json::from_str(&frame).expect("client sent invalid JSON")
    }

    /// Next frame must be a REQ; returns `(wire id, filters)`.
    pub async fn expect_req(&mut self) -> (String, Vec<Filter>) {
        let frame = self.expect_frame().await;
        assert_eq!(frame[0], "REQ", "expected REQ, got {frame}");
        let wire_id = frame[1].as_str().expect("wire id").to_string();
        let filters = frame.as_array().expect("array")[2..]
            .iter()
            .map(|f| serde_json::from_value(f.clone()).expect("filter"))
            .collect();
        (wire_id, filters)
    }

    /// Next frame must be an EVENT publish; returns the event.
    pub async fn expect_publish(&mut self) -> Event {
        let frame = self.expect_frame().await;
        assert_eq!(frame[0], "EVENT", "expected EVENT, got {frame}");
        serde_json::from_value(frame[1].clone()).expect("event")
    }

    /// Next frame must be a CLOSE; returns the wire id.
    pub async fn expect_close(&mut self) -> String {
        let frame = self.expect_frame().await;
        assert_eq!(frame[0], "CLOSE", "expected CLOSE, got {frame}");
        frame[1].as_str().expect("wire id").to_string()
    }

    pub fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.outgoing.send(frame.into());
    }

    pub fn send_event(&self, wire_id: &str, event: &Event) {
        self.send_raw(format!("[\"EVENT\",\"{wire_id}\",{}]", event.as_json()));
    }

    pub fn send_eose(&self, wire_id: &str) {
        self.send_raw(format!("[\"EOSE\",\"{wire_id}\"]"));
    }

    pub fn send_ok(&self, event_id: EventId, accepted: bool, message: &str) {
        self.send_raw(format!(
            "[\"OK\",\"{event_id}\",{accepted},{}]",
            serde_json::to_string(message).expect("string")
        ));
    }

    pub fn send_notice(&self, message: &str) {
        self.send_raw(format!(
            "[\"NOTICE\",{}]",
            serde_json::to_string(message).expect("string")
        ));
    }

    pub fn send_closed(&self, wire_id: &str, reason: &str) {
        self.send_raw(format!(
            "[\"CLOSED\",\"{wire_id}\",{}]",
            serde_json::to_string(reason).expect("string")
        ));
    }

    /// Drop the connection; the client observes a clean close and
    /// reconnects with backoff.
    pub fn disconnect(self) {}
}

/// A signed text note.
pub fn text_note(keys: &Keys, content: &str) -> Event {
    EventBuilder::new(kind::TEXT_NOTE, content)
        .sign(keys)
        .expect("signing with local keys")
}

/// A signed text note with a corrupted signature.
pub fn forged_note(keys: &Keys, content: &str) -> Event {
    let mut event = text_note(keys, content);
    let mut bytes = event.sig.to_bytes();
    bytes[0] ^= 0x01;
    event.sig = Signature::from_bytes(bytes);
    event
}
