//! Byte-level transports underneath the structured-data protocols.
//!
//! Inbound bytes accumulate in a [`ReadBuffer`] whose cursor can be committed
//! once a whole message has been processed, or rolled back when the message
//! turned out to be incomplete. Outbound bytes collect in an [`OutputBuffer`]
//! and become visible to the carrier only when the protocol flushes.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Largest message accepted by the length-prefixed transport (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Transport traits
// ---------------------------------------------------------------------------

/// Source of bytes for an input protocol.
pub trait ReadTransport {
    /// Unread bytes currently available.
    fn chunk(&self) -> &[u8];

    /// Marks `n` bytes of [`chunk`](Self::chunk) as read.
    fn advance(&mut self, n: usize);

    /// Fills `buf` completely or fails with `Underrun` without consuming.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Underrun` if fewer than `buf.len()` bytes remain.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let available = self.chunk();
        if available.len() < buf.len() {
            return Err(ProtocolError::Underrun);
        }
        buf.copy_from_slice(&available[..buf.len()]);
        self.advance(buf.len());
        Ok(())
    }

    /// Reads exactly `len` bytes into a new vector.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Underrun` if fewer than `len` bytes remain.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let available = self.chunk();
        if available.len() < len {
            return Err(ProtocolError::Underrun);
        }
        let out = available[..len].to_vec();
        self.advance(len);
        Ok(out)
    }
}

impl<T: ReadTransport + ?Sized> ReadTransport for &mut T {
    fn chunk(&self) -> &[u8] {
        (**self).chunk()
    }

    fn advance(&mut self, n: usize) {
        (**self).advance(n);
    }
}

impl<T: ReadTransport + ?Sized> ReadTransport for Box<T> {
    fn chunk(&self) -> &[u8] {
        (**self).chunk()
    }

    fn advance(&mut self, n: usize) {
        (**self).advance(n);
    }
}

/// Sink for an output protocol.
pub trait WriteTransport {
    /// Appends bytes to the pending message.
    fn write_all(&mut self, bytes: &[u8]);

    /// Completes the pending message and hands it to the carrier.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::SizeLimit` if the message cannot be framed.
    fn flush(&mut self) -> Result<()>;
}

impl<T: WriteTransport + ?Sized> WriteTransport for &mut T {
    fn write_all(&mut self, bytes: &[u8]) {
        (**self).write_all(bytes);
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<T: WriteTransport + ?Sized> WriteTransport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) {
        (**self).write_all(bytes);
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

// ---------------------------------------------------------------------------
// ReadBuffer
// ---------------------------------------------------------------------------

/// Inbound byte store with a resettable read cursor.
///
/// Bytes are never discarded by reading; only [`commit_position`] drops
/// what has been read so far. [`rollback_position`] rewinds the cursor to the
/// last commit, so a partially decoded message can be retried once more
/// bytes have been pushed.
///
/// [`commit_position`]: ReadBuffer::commit_position
/// [`rollback_position`]: ReadBuffer::rollback_position
#[derive(Debug, Default)]
pub struct ReadBuffer {
    data: BytesMut,
    cursor: usize,
}

impl ReadBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly arrived bytes after everything already buffered.
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Read position relative to the last commit.
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Number of bytes retained since the last commit, read or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drops everything read so far; the cursor becomes the new origin.
    pub fn commit_position(&mut self) {
        self.data.advance(self.cursor);
        self.cursor = 0;
    }

    /// Rewinds the cursor to the last commit.
    pub fn rollback_position(&mut self) {
        self.cursor = 0;
    }

    /// Marks every buffered byte as read.
    pub fn skip_remaining(&mut self) {
        self.cursor = self.data.len();
    }
}

impl ReadTransport for ReadBuffer {
    fn chunk(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed reader
// ---------------------------------------------------------------------------

/// One message read out of a length-prefixed stream.
#[derive(Debug)]
struct FramedReader {
    data: Vec<u8>,
    pos: usize,
}

impl FramedReader {
    fn open(source: &mut dyn ReadTransport, max_frame_size: usize) -> Result<Self> {
        let mut prefix = [0u8; 4];
        source.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > max_frame_size {
            return Err(ProtocolError::SizeLimit {
                size: len,
                limit: max_frame_size,
            });
        }
        let data = source.read_vec(len)?;
        Ok(Self { data, pos: 0 })
    }
}

impl ReadTransport for FramedReader {
    fn chunk(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }
}

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Transport layered between a carrier and a protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Messages are written back to back with no extra framing.
    #[default]
    Buffered,
    /// Every message is preceded by its 4-byte big-endian length.
    Framed,
}

impl TransportKind {
    /// Opens a read transport for the next message in `buf`.
    ///
    /// # Errors
    ///
    /// For `Framed`, returns `Underrun` until the whole frame is buffered and
    /// `SizeLimit` for oversized frames.
    pub fn open_input<'a>(self, buf: &'a mut ReadBuffer) -> Result<Box<dyn ReadTransport + 'a>> {
        match self {
            Self::Buffered => Ok(Box::new(buf)),
            Self::Framed => Ok(Box::new(FramedReader::open(buf, DEFAULT_MAX_FRAME_SIZE)?)),
        }
    }

    /// Creates an empty outgoing buffer for this transport.
    #[must_use]
    pub fn output_buffer(self) -> OutputBuffer {
        OutputBuffer::new(self)
    }
}

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// Outgoing buffer; flushed messages accumulate until taken by the carrier.
#[derive(Debug)]
pub struct OutputBuffer {
    kind: TransportKind,
    pending: BytesMut,
    flushed: BytesMut,
}

impl OutputBuffer {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            pending: BytesMut::new(),
            flushed: BytesMut::new(),
        }
    }

    /// Bytes written since the last flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Takes every flushed message, leaving the buffer empty.
    pub fn take_flushed(&mut self) -> Bytes {
        self.flushed.split().freeze()
    }
}

impl WriteTransport for OutputBuffer {
    fn write_all(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn flush(&mut self) -> Result<()> {
        if self.kind == TransportKind::Framed {
            let len = u32::try_from(self.pending.len()).map_err(|_| ProtocolError::SizeLimit {
                size: self.pending.len(),
                limit: u32::MAX as usize,
            })?;
            self.flushed.put_u32(len);
        }
        self.flushed.extend_from_slice(&self.pending);
        self.pending.clear();
        Ok(())
    }
}

/// Cloneable handle letting several writers share one outgoing buffer.
#[derive(Debug, Clone)]
pub struct SharedTransport {
    inner: Arc<Mutex<OutputBuffer>>,
}

impl SharedTransport {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputBuffer::new(kind))),
        }
    }

    /// Takes every message flushed by any writer so far.
    #[must_use]
    pub fn take_flushed(&self) -> Bytes {
        self.inner.lock().take_flushed()
    }
}

impl WriteTransport for SharedTransport {
    fn write_all(&mut self, bytes: &[u8]) {
        self.inner.lock().write_all(bytes);
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flush()
    }
}
