/// A growable byte buffer backing a single handoff-buffer slot.
///
/// Preallocated to a codec's maximum encoded body length and reused across
/// every sequence that hashes to the slot; only the logical length changes
/// between uses.
#[derive(Debug, Default)]
pub struct Payload {
    bytes: Vec<u8>,
    len: usize,
}

impl Payload {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { bytes: vec![0u8; capacity], len: 0 }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Sets the logical length. `len` must not exceed `capacity()`; the
    /// caller is responsible for having written valid bytes up to it.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.bytes.len(), "payload length exceeds preallocated capacity");
        self.len = len;
    }

    #[inline]
    pub fn spare_capacity_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.len..]
    }

    /// Appends `data`, growing the backing allocation if the preallocated
    /// capacity is insufficient (the "expandable" half of the contract).
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let end = self.len + data.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[self.len..end].copy_from_slice(data);
        self.len = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_preallocated_capacity() {
        let mut p = Payload::with_capacity(16);
        assert_eq!(p.capacity(), 16);
        p.extend_from_slice(b"hello");
        assert_eq!(p.as_slice(), b"hello");
        p.clear();
        assert!(p.is_empty());
        assert_eq!(p.capacity(), 16);
    }

    #[test]
    fn grows_past_preallocated_capacity() {
        let mut p = Payload::with_capacity(4);
        p.extend_from_slice(b"this is longer than four bytes");
        assert_eq!(p.as_slice(), b"this is longer than four bytes");
    }
}
