// XOR masking per RFC 6455 Section 5.3.

/// Masks or unmasks a payload in place with the given 4-byte key.
///
/// XOR is its own inverse, so one routine serves both directions. The key
/// repeats every four bytes; widening it once to an eight-byte pattern lets
/// the bulk of the buffer be processed a word at a time, and because eight
/// is a multiple of the key length the pattern never falls out of phase.
/// The sub-word tail gets plain per-byte XOR.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let pattern = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ pattern;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
