use crate::error::{Error, Result};
use crate::RCV_BUF_GROW_SIZE;

/// A growable byte container holding the unparsed bytes between readable
/// events on a TCP or local-domain `Connection`.
///
/// Capacity grows in fixed-size chunks (see [`crate::RCV_BUF_GROW_SIZE`])
/// rather than Rust's default amortized-doubling strategy, matching the
/// original library's `adt_bytearray` contract: `reserve(n)` allocates in
/// multiples of the grow size, never less than `n` in one reallocation.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    /// A buffer pre-reserved to [`crate::MIN_RCV_BUF_SIZE`].
    pub fn new() -> RecvBuffer {
        let mut buf = RecvBuffer { data: Vec::new() };
        // A fresh buffer always starts at the minimum capacity; allocation
        // failure here is as fatal as anywhere else `reserve` can fail.
        let _ = buf.reserve(crate::MIN_RCV_BUF_SIZE);
        buf
    }

    /// Ensure spare capacity for at least `n` additional bytes, growing by
    /// whole multiples of [`crate::RCV_BUF_GROW_SIZE`].
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if self.data.capacity() - self.data.len() >= n {
            return Ok(());
        }
        let needed = n.saturating_sub(self.data.capacity() - self.data.len());
        let chunks = needed.div_ceil(RCV_BUF_GROW_SIZE).max(1);
        let grow_by = chunks * RCV_BUF_GROW_SIZE;
        self.data
            .try_reserve(grow_by)
            .map_err(|_| Error::out_of_memory())
    }

    /// Append `bytes` to the end of the buffer, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Discard the leading `count` bytes, sliding the remaining suffix down
    /// to offset 0.
    ///
    /// `count` must be `<= self.length()`; composed with [`Self::append`]
    /// this implements a sliding window: `append(a); trim_left(k);
    /// append(b)` yields `a[k:] ++ b`.
    pub fn trim_left(&mut self, count: usize) {
        assert!(count <= self.data.len(), "trim_left count exceeds length");
        self.data.drain(0..count);
    }

    /// Reset the length to zero without releasing capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// The number of unparsed bytes currently held.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// `true` if no unparsed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A read-only view of the unparsed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_trim_is_sliding_window() {
        let mut buf = RecvBuffer::new();
        buf.append(b"hello world").unwrap();
        buf.trim_left(6);
        assert_eq!(buf.data(), b"world");
        buf.append(b"!").unwrap();
        assert_eq!(buf.data(), b"world!");
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = RecvBuffer::new();
        buf.append(b"some bytes").unwrap();
        let cap_before = buf.data.capacity();
        buf.clear();
        assert_eq!(buf.length(), 0);
        assert_eq!(buf.data.capacity(), cap_before);
    }

    #[test]
    fn grows_in_fixed_chunks() {
        let mut buf = RecvBuffer::new();
        let starting_cap = buf.data.capacity();
        assert!(starting_cap >= crate::MIN_RCV_BUF_SIZE);
        let big = vec![0u8; starting_cap + 1];
        buf.append(&big).unwrap();
        assert!(buf.data.capacity() >= starting_cap + crate::RCV_BUF_GROW_SIZE);
    }

    #[test]
    fn trim_left_zero_is_noop() {
        let mut buf = RecvBuffer::new();
        buf.append(b"abc").unwrap();
        buf.trim_left(0);
        assert_eq!(buf.data(), b"abc");
    }

    #[test]
    #[should_panic]
    fn trim_left_past_length_panics() {
        let mut buf = RecvBuffer::new();
        buf.append(b"ab").unwrap();
        buf.trim_left(3);
    }
}
