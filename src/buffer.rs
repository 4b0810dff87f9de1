//! A growable byte region reused across blocks.
//!
//! Buffers are recycled between operations (and between threads via the job
//! free list), so the backing allocation is never shrunk: `data` only grows,
//! while `sz` tracks the logical length and `pos` the consumer cursor.

/// A reusable byte buffer with a logical length and a cursor.
///
/// Invariants: `pos <= sz <= data.len()`.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    /// Logical length of the buffered content
    pub sz: usize,
    /// Cursor into the logical content
    pub pos: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            sz: 0,
            pos: 0,
        }
    }

    /// Grows the backing allocation to at least `capacity` bytes.
    /// The logical length and cursor are unchanged.
    pub fn reserve(&mut self, capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
    }

    /// Resets the logical length and cursor, keeping the allocation.
    pub fn clear(&mut self) {
        self.sz = 0;
        self.pos = 0;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The buffered content, `sz` bytes long.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.sz]
    }

    /// The unconsumed tail of the content, from `pos` to `sz`.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..self.sz]
    }

    /// The filled prefix up to the cursor. Used on the write side, where
    /// `pos` is the fill level of the block being assembled.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Raw access to the backing allocation, e.g. as a decompression target.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Hands out up to `n` unconsumed bytes and advances the cursor past
    /// them.
    pub fn take(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.sz - self.pos);
        let start = self.pos;
        self.pos += n;
        &self.data[start..start + n]
    }

    /// Appends `bytes` at `pos`, growing as needed, and advances `pos` and
    /// `sz` together. Used when filling a block for writing, where `pos` is
    /// the fill level.
    pub fn push(&mut self, bytes: &[u8]) {
        self.reserve(self.pos + bytes.len());
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.sz = self.sz.max(self.pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_never_shrinks() {
        let mut buf = Buffer::with_capacity(128);
        buf.reserve(64);
        assert_eq!(buf.capacity(), 128);
        buf.reserve(256);
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn test_push_tracks_cursor() {
        let mut buf = Buffer::with_capacity(4);
        buf.push(b"abc");
        buf.push(b"defg");
        assert_eq!(buf.pos, 7);
        assert_eq!(buf.as_slice(), b"abcdefg");
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut buf = Buffer::with_capacity(0);
        buf.push(b"hello");
        let cap = buf.capacity();
        buf.clear();
        assert_eq!(buf.sz, 0);
        assert_eq!(buf.pos, 0);
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_remaining_window() {
        let mut buf = Buffer::with_capacity(0);
        buf.push(b"0123456789");
        buf.pos = 4;
        assert_eq!(buf.remaining(), b"456789");
    }
}
