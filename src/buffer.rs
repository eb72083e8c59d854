//! Fixed-capacity inbound byte buffer.
//!
//! A [`Buffer`] is owned by exactly one connection and written by at most one
//! in-flight read at a time. Unlike a plain [`BytesMut`], it never grows past
//! the capacity it was created with: a read that would overflow simply sees
//! no spare room, and the connection turns that into a "too large" rejection
//! instead of buffering without bound.

use bytes::{Buf, BufMut, BytesMut, buf::Limit};

/// A reusable, fixed-capacity byte region.
///
/// Valid bytes live in `[0, len)`. [`consume`](Self::consume) advances the
/// read cursor past bytes that have been fully processed; whatever follows
/// them stays valid, so pipelined data survives between requests.
///
/// # Examples
///
/// ```
/// use httpconn::Buffer;
///
/// let mut buf = Buffer::with_capacity(8);
/// assert_eq!(buf.fill_from_slice(b"GET / HTTP/1.1"), 8);
/// assert!(buf.is_full());
///
/// buf.consume(4);
/// assert_eq!(buf.filled(), b"/ HT");
/// assert_eq!(buf.remaining(), 4);
/// ```
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    capacity: usize,
}

impl Buffer {
    /// Creates an empty buffer that will hold at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the fixed capacity of this buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of valid bytes currently held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer holds no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns how many more bytes can be written before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Returns `true` if no further bytes can be written.
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the valid bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data
    }

    /// Returns a writer over the spare capacity.
    ///
    /// The returned [`BufMut`] is capped at [`remaining`](Self::remaining), so
    /// `AsyncReadExt::read_buf` through it can never push the buffer past its
    /// capacity.
    pub fn spare_mut(&mut self) -> Limit<&mut BytesMut> {
        let remaining = self.remaining();
        (&mut self.data).limit(remaining)
    }

    /// Copies as much of `src` as fits and returns the number of bytes copied.
    pub fn fill_from_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data.put_slice(&src[..n]);
        n
    }

    /// Discards the first `n` valid bytes, keeping anything after them.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        // BytesMut reclaims the consumed prefix on its next reserve.
        self.data.advance(n);
    }

    /// Discards every valid byte.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
