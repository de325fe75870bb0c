//! Transports carry whole records between a client and the hub.
//!
//! The hub only needs three things from a transport: a way to read the next
//! record, a way to write one, and a way to say the stream is over. Framing
//! is the transport's job; the hub sees complete records.
//!
//! - `stream`: record-separator framing over any `AsyncRead`/`AsyncWrite`,
//!   used for TCP.
//! - `memory`: channel pair, one record per message, for tests and for
//!   embedding the hub in-process.

use std::future::Future;
use std::io;

use bytes::Bytes;

use crate::error::Result;

pub mod memory;
pub mod stream;

pub use memory::{MemoryClient, MemoryTransport};
pub use stream::{StreamTransport, TcpTransport};

/// Read half of a transport.
pub trait FrameReader: Send + 'static {
    /// Wait for the next record. `Ok(None)` means the peer closed cleanly.
    ///
    /// [`HubError::MessageTooLarge`](crate::error::HubError::MessageTooLarge)
    /// is recoverable and the caller may keep reading;
    /// [`HubError::Transport`](crate::error::HubError::Transport) is not.
    fn read_frame(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// Write half of a transport.
pub trait FrameWriter: Send + 'static {
    /// Write one encoded record.
    fn write_frame(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Signal end of stream to the peer.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// A duplex transport that can be split into independently owned halves.
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Peer address, for logging.
    fn peer(&self) -> Option<String> {
        None
    }

    fn split(self) -> (Self::Reader, Self::Writer);
}
