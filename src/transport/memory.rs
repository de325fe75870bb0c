//! In-process transport built on channels.
//!
//! Each channel message is one complete record, so no byte framing is
//! involved. The hub still applies its codec limits to every record.

use std::io;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{FrameReader, FrameWriter, Transport};
use crate::error::{HubError, Result};
use crate::protocol::{Codec, HubMessage, Invocation, PROTOCOL_NAME, PROTOCOL_VERSION};

/// Create a connected transport/client pair.
///
/// `capacity` bounds each direction.
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryClient) {
    let (to_hub, from_client) = mpsc::channel(capacity);
    let (to_client, from_hub) = mpsc::channel(capacity);
    (
        MemoryTransport {
            inbound: from_client,
            outbound: to_client,
        },
        MemoryClient {
            outbound: Some(to_hub),
            inbound: from_hub,
            codec: Codec::default(),
        },
    )
}

/// Hub side of an in-memory connection.
pub struct MemoryTransport {
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn peer(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            MemoryReader { rx: self.inbound },
            MemoryWriter {
                tx: Some(self.outbound),
            },
        )
    }
}

pub struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer shut down"))?;
        tx.send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client dropped"))
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct MemoryClient {
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Bytes>,
    codec: Codec,
}

impl MemoryClient {
    /// Send a raw record.
    pub async fn send_raw(&self, frame: impl Into<Bytes>) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or_else(|| {
            HubError::Transport(io::Error::new(io::ErrorKind::NotConnected, "client closed"))
        })?;
        tx.send(frame.into()).await.map_err(|_| {
            HubError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "hub dropped"))
        })
    }

    /// Send an encoded message.
    pub async fn send(&self, msg: &HubMessage) -> Result<()> {
        self.send_raw(self.codec.encode(msg)?).await
    }

    /// Invoke a hub method, optionally asking for a completion.
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
        invocation_id: Option<&str>,
    ) -> Result<()> {
        let invocation = Invocation {
            target: target.to_string(),
            arguments,
            invocation_id: invocation_id.map(str::to_owned),
        };
        self.send(&HubMessage::Invocation(invocation)).await
    }

    /// Perform the protocol handshake and wait for the hub's answer.
    pub async fn handshake(&mut self) -> Result<()> {
        let request = format!(r#"{{"protocol":"{PROTOCOL_NAME}","version":{PROTOCOL_VERSION}}}"#);
        let mut frame = request.into_bytes();
        frame.push(crate::protocol::RECORD_SEPARATOR);
        self.send_raw(frame).await?;
        self.read_handshake_response().await
    }

    /// Wait for the handshake response.
    pub async fn read_handshake_response(&mut self) -> Result<()> {
        let frame = self
            .recv_raw()
            .await
            .ok_or_else(|| HubError::Handshake("closed before handshake response".into()))?;
        let body = frame
            .strip_suffix(&[crate::protocol::RECORD_SEPARATOR])
            .unwrap_or(&frame[..]);
        let response: Value = serde_json::from_slice(body)?;
        match response.get("error").and_then(Value::as_str) {
            Some(error) => Err(HubError::Handshake(error.to_string())),
            None => Ok(()),
        }
    }

    /// Next raw record from the hub, `None` once the hub closed the stream.
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Next decoded message from the hub.
    pub async fn recv(&mut self) -> Option<Result<HubMessage>> {
        let frame = self.recv_raw().await?;
        Some(self.codec.decode(&frame))
    }

    /// Next message that is not a keep-alive ping.
    pub async fn recv_skip_pings(&mut self) -> Option<Result<HubMessage>> {
        loop {
            match self.recv().await? {
                Ok(HubMessage::Ping) => continue,
                other => return Some(other),
            }
        }
    }

    /// Stop sending; the hub sees end of stream.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}
