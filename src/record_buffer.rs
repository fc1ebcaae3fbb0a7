//! Accumulation buffer for incoming TLS record bytes.
//!
//! Ciphertext arrives from the transport in arbitrarily-sized chunks,
//! but the engine's `unwrap` needs a contiguous slice holding at least
//! one complete record. This buffer is a read cursor over a single
//! `Vec<u8>`: chunks land at the tail, the engine consumes from the
//! cursor, and the consumed prefix is only reclaimed when an append
//! would otherwise have to allocate. Capacity starts small (1 KiB) so
//! idle connections stay cheap and doubles as records outgrow it, up to
//! a hard ceiling; upstream flow control keeps the steady state well
//! below that, so hitting the ceiling means the peer is overrunning its
//! window.

use bytes::Buf;

use std::io;

/// Initial capacity of a fresh buffer.
pub(crate) const INITIAL_CAPACITY: usize = 1024;

/// Readable length above which upstream credit is withheld.
pub(crate) const TARGET_BUFSIZE: usize = 16 * 1024;

/// Hard ceiling on buffered record bytes.
pub(crate) const MAX_CAPACITY: usize = 256 * 1024;

/// Byte storage with a read cursor. Everything from the cursor to the
/// end of the vec is unconsumed record data, always contiguous.
pub(crate) struct RecordBuffer {
    data: Vec<u8>,
    /// Read cursor; `data[pos..]` is live.
    pos: usize,
    max_capacity: usize,
}

impl RecordBuffer {
    pub(crate) fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial_capacity),
            pos: 0,
            max_capacity,
        }
    }

    /// Number of readable bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The readable region.
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Advance the read cursor past `n` consumed bytes. Consuming the
    /// last live byte rewinds to the front so the whole allocation is
    /// reusable without any copying.
    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consumed past the end of the record buffer");
        self.pos += n;
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
    }

    /// Append record bytes. When the tail is full, the consumed prefix
    /// is dropped first; only if the live bytes still do not fit does
    /// the allocation double (repeatedly, up to the ceiling). Fails when
    /// live bytes plus the new chunk would exceed the ceiling outright.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let live = self.len() + bytes.len();
        if live > self.max_capacity {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "record buffer overflow: {} buffered + {} incoming exceeds {} max",
                    self.len(),
                    bytes.len(),
                    self.max_capacity
                ),
            ));
        }
        if self.data.len() + bytes.len() > self.data.capacity() {
            if self.pos > 0 {
                // Shift the live tail down over the consumed prefix;
                // often that alone makes room.
                self.data.drain(..self.pos);
                self.pos = 0;
            }
            if live > self.data.capacity() {
                let mut target = self.data.capacity().max(1);
                while target < live {
                    target *= 2;
                }
                let target = target.min(self.max_capacity);
                self.data.reserve_exact(target - self.data.len());
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

// The engine consumes record bytes through the standard Buf cursor.
impl Buf for RecordBuffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.len()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}
