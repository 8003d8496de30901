//! Handshake I/O driver
//!
//! Binds a [`StreamReader`] to one raw connection. Every read step queues a
//! request on the reader and pulls bytes from the connection until that
//! request completes. The driver never asks the connection for more bytes
//! than the head request still needs, so nothing past the handshake is
//! consumed and the raw connection can be handed on as-is.

use crate::error::SocksError;
use crate::protocol::{BinaryFormat, Fields, Pending, StreamReader};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const CHUNK_SIZE: usize = 512;

pub(crate) struct SessionIo<'a, S> {
    stream: &'a mut S,
    reader: StreamReader,
    chunk: [u8; CHUNK_SIZE],
}

impl<'a, S> SessionIo<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: &'a mut S) -> Self {
        SessionIo {
            stream,
            reader: StreamReader::new(),
            chunk: [0u8; CHUNK_SIZE],
        }
    }

    pub(crate) fn stream(&mut self) -> &mut S {
        &mut *self.stream
    }

    /// Bytes received from the peer that no handshake step consumed
    pub(crate) fn take_buffered(&mut self) -> Bytes {
        self.reader.take_buffer()
    }

    pub(crate) async fn read_byte(&mut self) -> Result<u8, SocksError> {
        let pending = self.reader.read_byte();
        self.complete(pending).await
    }

    pub(crate) async fn read_byte_assert(&mut self, expected: u8) -> Result<u8, SocksError> {
        let pending = self.reader.read_byte_assert(expected);
        self.complete(pending).await
    }

    pub(crate) async fn read_length(&mut self, len: usize) -> Result<Bytes, SocksError> {
        let pending = self.reader.read_length(len);
        self.complete(pending).await
    }

    pub(crate) async fn read_binary(
        &mut self,
        format: &BinaryFormat,
    ) -> Result<Fields, SocksError> {
        let pending = self.reader.read_binary(format);
        self.complete(pending).await
    }

    pub(crate) async fn read_string_null(&mut self, max: usize) -> Result<Bytes, SocksError> {
        let pending = self.reader.read_string_null_max(max);
        self.complete(pending).await
    }

    /// Write a complete protocol message
    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), SocksError> {
        trace!("Sending {} handshake bytes", bytes.len());
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn complete<T>(&mut self, mut pending: Pending<T>) -> Result<T, SocksError> {
        loop {
            if let Some(result) = pending.try_take() {
                return Ok(result?);
            }

            let want = self.reader.wanted().clamp(1, CHUNK_SIZE);
            let n = self.stream.read(&mut self.chunk[..want]).await?;
            if n == 0 {
                return Err(SocksError::ConnectionLost(
                    "Premature end while establishing socks session".to_string(),
                ));
            }
            self.reader.write(&self.chunk[..n]);
        }
    }
}

/// Look up a field declared in a [`BinaryFormat`]
pub(crate) fn field(fields: &Fields, name: &str) -> Result<u32, SocksError> {
    fields
        .get(name)
        .ok_or_else(|| SocksError::Protocol(format!("Missing field {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_session_reads_across_chunks() {
        let (mut peer, mut stream) = duplex(64);
        let mut io = SessionIo::new(&mut stream);

        let writer = tokio::spawn(async move {
            peer.write_all(b"\x05").await.unwrap();
            peer.write_all(b"\x00\x50").await.unwrap();
            peer.write_all(b"host\x00").await.unwrap();
            peer
        });

        let format = BinaryFormat::new(&[("version", 1), ("port", 2)]).unwrap();
        let fields = io.read_binary(&format).await.unwrap();
        assert_eq!(field(&fields, "version").unwrap(), 5);
        assert_eq!(field(&fields, "port").unwrap(), 80);
        assert!(field(&fields, "type").is_err());

        let host = io.read_string_null(255).await.unwrap();
        assert_eq!(&host[..], b"host");
        assert!(io.take_buffered().is_empty());

        let _peer = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_premature_end() {
        let (mut peer, mut stream) = duplex(64);
        peer.write_all(b"\x05").await.unwrap();
        drop(peer);

        let mut io = SessionIo::new(&mut stream);
        assert_eq!(io.read_byte().await.unwrap(), 5);

        let err = io.read_length(2).await.unwrap_err();
        assert!(matches!(err, SocksError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_session_does_not_over_read() {
        let (mut peer, mut stream) = duplex(64);
        peer.write_all(b"\x01\x02payload").await.unwrap();

        {
            let mut io = SessionIo::new(&mut stream);
            assert_eq!(io.read_byte_assert(0x01).await.unwrap(), 1);
            assert_eq!(io.read_byte().await.unwrap(), 2);
        }

        let mut rest = [0u8; 7];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn test_session_string_null_limit() {
        let (mut peer, mut stream) = duplex(1024);
        peer.write_all(&[b'a'; 300]).await.unwrap();

        let mut io = SessionIo::new(&mut stream);
        let err = io.read_string_null(255).await.unwrap_err();
        assert!(matches!(err, SocksError::Protocol(_)));
        drop(io);

        // stops pulling from the transport once the limit is hit
        let mut rest = [0u8; 44];
        stream.read_exact(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_assert_mismatch() {
        let (mut peer, mut stream) = duplex(64);
        peer.write_all(b"\x02").await.unwrap();

        let mut io = SessionIo::new(&mut stream);
        let err = io.read_byte_assert(0x01).await.unwrap_err();
        assert!(matches!(err, SocksError::Protocol(_)));
    }
}
