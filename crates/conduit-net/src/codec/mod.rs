//! Framing codec contract (spec.md §4.1) plus the handful of concrete wire
//! formats the core ships as dependency-free illustrations (spec.md §6):
//! the two length-prefix codecs and the generic checksum wrapper. Real
//! compression codecs (deflate, lz4) are deliberately left as external
//! collaborators per spec.md §1 — the core only needs something implementing
//! [`Codec`]; see SPEC_FULL.md §2/§3 for the reasoning.

mod checksum;
mod length;

pub use checksum::{ChecksumAlgorithm, ChecksumCodec, Crc32};
pub use length::{IntLengthCodec, ShortLengthCodec};

use conduit_comm::CodecError;

/// Pure transducer between a logical (cleartext) message and a framed byte
/// stream. Has no socket knowledge: every method operates purely on byte
/// slices with explicit cursors, so the same codec instance is equally at
/// home reading off a TCP scratch buffer or a UDP datagram.
///
/// Implementations must satisfy spec.md §8's testable properties:
/// `get(put(m)) == m` for any valid `m`; `has_next` is a pure function of
/// `wire`'s unconsumed bytes and never mutates `wire`'s logical position.
pub trait Codec: Send {
    /// Upper bound on a single encoded frame, header and footer included.
    /// Scratch buffers are sized against this (spec.md §3, §6).
    fn frame_length(&self) -> usize;

    /// Bytes `put` will write for this cleartext message.
    fn encoded_len(&self, msg: &[u8]) -> usize;

    /// Whether `msg` can be encoded by `put` at all.
    fn is_valid(&self, msg: &[u8]) -> bool;

    /// Encodes `msg` into `out`, appending at most `encoded_len(msg)` bytes.
    ///
    /// # Errors
    /// [`CodecError::InvalidMessage`] if `!is_valid(msg)`.
    fn put(&mut self, msg: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Whether a complete frame is available at the front of `wire`. Pure:
    /// must not be observable as having advanced any cursor.
    ///
    /// # Errors
    /// [`CodecError::InvalidLength`] if a declared length is out of range.
    fn has_next(&self, wire: &[u8]) -> Result<bool, CodecError>;

    /// Bytes `get` will consume from `wire` for the next frame. Only valid
    /// to call once `has_next(wire)` is `true`.
    fn decoded_len(&self, wire: &[u8]) -> usize;

    /// Decodes one frame from the front of `wire` into `out`, returning the
    /// number of wire bytes consumed. The caller advances its own cursor by
    /// the returned amount; `wire` itself is not mutated.
    ///
    /// # Errors
    /// [`CodecError::InvalidLength`] or [`CodecError::ChecksumMismatch`] for
    /// a malformed frame.
    fn get(&mut self, wire: &[u8], out: &mut Vec<u8>) -> Result<usize, CodecError>;

    fn close(&mut self) {}
}

#[cfg(test)]
mod contract_tests {
    use super::*;

    fn round_trip<C: Codec>(mut codec: C, msg: &[u8]) {
        let mut wire = Vec::new();
        codec.put(msg, &mut wire).unwrap();
        assert!(codec.has_next(&wire).unwrap());
        let before = wire.clone();
        let declared = codec.decoded_len(&wire);
        let mut decoded = Vec::new();
        let consumed = codec.get(&wire, &mut decoded).unwrap();
        assert_eq!(wire, before, "has_next/get must not mutate the wire buffer itself");
        assert_eq!(consumed, wire.len());
        assert_eq!(declared, decoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn short_length_round_trips() {
        round_trip(ShortLengthCodec::new(4096), b"hello world");
    }

    #[test]
    fn int_length_round_trips() {
        round_trip(IntLengthCodec::new(1 << 20), &vec![7u8; 70_000]);
    }

    #[test]
    fn checksum_wrapped_round_trips() {
        round_trip(ChecksumCodec::new(ShortLengthCodec::new(4096), Crc32::default()), b"checked payload");
    }

    #[test]
    fn empty_and_oversized_bodies_are_invalid() {
        let codec = ShortLengthCodec::new(8);
        assert!(!codec.is_valid(b""));
        assert!(!codec.is_valid(&vec![0u8; 9]));
        assert!(codec.is_valid(&vec![0u8; 8]));
    }

    #[test]
    fn has_next_on_partial_header_is_false_and_pure() {
        let codec = IntLengthCodec::new(1 << 20);
        let partial = [0u8; 1];
        assert_eq!(codec.has_next(&partial).unwrap(), false);
        assert_eq!(partial.len(), 1);
    }
}
