//! Record-separator framing over byte streams.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use super::{FrameReader, FrameWriter, Transport};
use crate::error::Result;
use crate::protocol::RecordFramer;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// A transport over a split byte stream.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    peer: Option<String>,
    max_message_size: usize,
}

/// TCP transport.
pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

impl TcpTransport {
    pub fn new(stream: TcpStream, max_message_size: usize) -> Self {
        let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        StreamTransport {
            reader,
            writer,
            peer,
            max_message_size,
        }
    }
}

impl<R, W> StreamTransport<R, W> {
    /// Wrap arbitrary stream halves.
    pub fn from_parts(reader: R, writer: W, max_message_size: usize) -> Self {
        Self {
            reader,
            writer,
            peer: None,
            max_message_size,
        }
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = StreamReader<R>;
    type Writer = StreamWriter<W>;

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            StreamReader::new(self.reader, self.max_message_size),
            StreamWriter { inner: self.writer },
        )
    }
}

/// Buffers stream bytes and hands out complete records.
pub struct StreamReader<R> {
    inner: R,
    buffer: BytesMut,
    framer: RecordFramer,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            framer: RecordFramer::new(max_message_size),
        }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameReader for StreamReader<R> {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(record) = self.framer.next_record(&mut self.buffer)? {
                return Ok(Some(record));
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    trace!(pending = self.buffer.len(), "Stream ended inside a record");
                }
                return Ok(None);
            }
        }
    }
}

/// Writes encoded records to a stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameWriter for StreamWriter<W> {
    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_reads_records_across_chunks() {
        let mock = Builder::new()
            .read(b"{\"protocol\":\"json\",")
            .read(b"\"version\":1}\x1e{\"type\":6}\x1e")
            .read(b"{\"type\":7}\x1e")
            .build();
        let mut reader = StreamReader::new(mock, 1024);

        assert_eq!(
            reader.read_frame().await.unwrap().unwrap(),
            &b"{\"protocol\":\"json\",\"version\":1}"[..]
        );
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), &b"{\"type\":6}"[..]);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), &b"{\"type\":7}"[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_record_then_recovers() {
        let mock = Builder::new()
            .read(b"xxxxxxxxxxxxxxxxxxxxxxxx")
            .read(b"xxxx\x1e{\"type\":6}\x1e")
            .build();
        let mut reader = StreamReader::new(mock, 16);

        assert!(matches!(
            reader.read_frame().await,
            Err(HubError::MessageTooLarge { limit: 16, .. })
        ));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), &b"{\"type\":6}"[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_transport_error() {
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = StreamReader::new(mock, 16);

        assert!(matches!(
            reader.read_frame().await,
            Err(HubError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_frames() {
        let mock = Builder::new().write(b"{}\x1e").write(b"{\"type\":6}\x1e").build();
        let mut writer = StreamWriter { inner: mock };

        writer.write_frame(Bytes::from_static(b"{}\x1e")).await.unwrap();
        writer
            .write_frame(Bytes::from_static(b"{\"type\":6}\x1e"))
            .await
            .unwrap();
    }
}
