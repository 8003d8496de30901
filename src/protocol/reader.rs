//! Incremental binary stream reader
//!
//! Raw bytes are pushed in with [`StreamReader::write`] using whatever chunk
//! boundaries the transport produced. Reads are queued and complete exactly
//! once, in FIFO order, as soon as enough bytes have accumulated. Bytes that
//! no queued read asks for stay buffered for the next read.

use crate::error::ReadError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadKind {
    /// Exactly this many bytes
    Exact(usize),
    /// Everything up to (excluding) the next NUL byte, at most this many bytes
    NullTerminated(usize),
}

#[derive(Debug)]
struct PendingRead {
    kind: ReadKind,
    tx: oneshot::Sender<Result<Bytes, ReadError>>,
}

/// Incremental de-framer with an explicit byte buffer and a FIFO of reads
#[derive(Debug, Default)]
pub struct StreamReader {
    buffer: BytesMut,
    queue: VecDeque<PendingRead>,
}

impl StreamReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and complete every queued read it satisfies
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.drain();
    }

    /// Read exactly `len` bytes
    pub fn read_length(&mut self, len: usize) -> Pending<Bytes> {
        self.enqueue(ReadKind::Exact(len), Ok)
    }

    /// Read a single byte
    pub fn read_byte(&mut self) -> Pending<u8> {
        self.enqueue(ReadKind::Exact(1), |bytes| Ok(bytes[0]))
    }

    /// Read a single byte and fail unless it equals `expected`
    pub fn read_byte_assert(&mut self, expected: u8) -> Pending<u8> {
        self.enqueue(ReadKind::Exact(1), move |bytes| {
            let actual = bytes[0];
            if actual == expected {
                Ok(actual)
            } else {
                Err(ReadError::UnexpectedByte { expected, actual })
            }
        })
    }

    /// Read a tuple of big-endian unsigned integers
    pub fn read_binary(&mut self, format: &BinaryFormat) -> Pending<Fields> {
        let format = format.clone();
        self.enqueue(ReadKind::Exact(format.len()), move |bytes| {
            Ok(format.decode(&bytes))
        })
    }

    /// Read bytes up to a NUL terminator, which is consumed but not returned
    pub fn read_string_null(&mut self) -> Pending<Bytes> {
        self.read_string_null_max(usize::MAX)
    }

    /// Like [`read_string_null`](Self::read_string_null), failing with
    /// [`ReadError::TooLong`] once `max` bytes arrived without a terminator
    pub fn read_string_null_max(&mut self, max: usize) -> Pending<Bytes> {
        self.enqueue(ReadKind::NullTerminated(max), Ok)
    }

    /// Bytes received but not yet claimed by any read
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Take all unclaimed bytes out of the reader
    pub fn take_buffer(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Number of reads still waiting for data
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// How many more bytes the head read needs at least
    ///
    /// Returns 0 when nothing is queued. A NUL-terminated read always asks
    /// for one byte at a time so callers never pull more from the transport
    /// than the handshake consumes.
    pub fn wanted(&self) -> usize {
        match self.queue.front().map(|read| read.kind) {
            None => 0,
            Some(ReadKind::Exact(len)) => len.saturating_sub(self.buffer.len()),
            Some(ReadKind::NullTerminated(_)) => {
                if self.buffer.contains(&0) {
                    0
                } else {
                    1
                }
            }
        }
    }

    fn enqueue<T, F>(&mut self, kind: ReadKind, decode: F) -> Pending<T>
    where
        F: FnOnce(Bytes) -> Result<T, ReadError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(PendingRead { kind, tx });
        self.drain();

        Pending {
            rx,
            decode: Some(Box::new(decode)),
        }
    }

    fn drain(&mut self) {
        while let Some(head) = self.queue.front() {
            let data = match head.kind {
                ReadKind::Exact(len) => {
                    if self.buffer.len() < len {
                        break;
                    }
                    Ok(self.buffer.split_to(len).freeze())
                }
                ReadKind::NullTerminated(max) => {
                    let limit = self.buffer.len().min(max.saturating_add(1));
                    let terminator = self.buffer[..limit].iter().position(|b| *b == 0x00);
                    match terminator {
                        Some(pos) => {
                            let data = self.buffer.split_to(pos).freeze();
                            self.buffer.advance(1);
                            Ok(data)
                        }
                        None if self.buffer.len() > max => Err(ReadError::TooLong(max)),
                        None => break,
                    }
                }
            };

            if let Some(read) = self.queue.pop_front() {
                // receiver may already be gone, the bytes are consumed either way
                let _ = read.tx.send(data);
            }
        }
    }
}

/// Field layout for [`StreamReader::read_binary`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFormat {
    fields: Vec<(&'static str, usize)>,
    len: usize,
}

impl BinaryFormat {
    /// Build a layout from `(name, width)` pairs; widths must be 1, 2 or 4
    pub fn new(fields: &[(&'static str, usize)]) -> Result<Self, ReadError> {
        let mut len = 0;
        for (_, width) in fields {
            match width {
                1 | 2 | 4 => len += width,
                other => return Err(ReadError::InvalidFormat(*other)),
            }
        }

        Ok(BinaryFormat {
            fields: fields.to_vec(),
            len,
        })
    }

    /// Total number of bytes covered by the layout
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the layout has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn decode(&self, mut bytes: &[u8]) -> Fields {
        let values = self
            .fields
            .iter()
            .map(|&(name, width)| {
                let value = match width {
                    1 => u32::from(bytes.get_u8()),
                    2 => u32::from(bytes.get_u16()),
                    _ => bytes.get_u32(),
                };
                (name, value)
            })
            .collect();

        Fields(values)
    }
}

/// Decoded fields in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fields(Vec<(&'static str, u32)>);

impl Fields {
    /// Value of the named field
    pub fn get(&self, name: &str) -> Option<u32> {
        self.0
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| *value)
    }

    /// Iterate over `(name, value)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        self.0.iter().copied()
    }
}

/// A queued read that resolves once its bytes have arrived
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<Bytes, ReadError>>,
    decode: Option<Box<dyn FnOnce(Bytes) -> Result<T, ReadError> + Send>>,
}

impl<T> Pending<T> {
    /// Take the result if the read has already completed
    pub fn try_take(&mut self) -> Option<Result<T, ReadError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result.and_then(|bytes| self.finish(bytes))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ReadError::Closed)),
        }
    }

    fn finish(&mut self, bytes: Bytes) -> Result<T, ReadError> {
        match self.decode.take() {
            Some(decode) => decode(bytes),
            None => Err(ReadError::Closed),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, ReadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result.and_then(|bytes| this.finish(bytes))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReadError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}
