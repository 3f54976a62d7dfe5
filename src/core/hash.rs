//! Content hashing for the dedup table.

/// Signature of a content hash function.
pub type ContentHasher = fn(&[u8]) -> u64;

const DJB2_SEED: u64 = 5381;

/// Hash of a string payload.
///
/// djb2 over the 8-byte little-endian length followed by the bytes, so a
/// string never shares a prefix stream with a longer one, then an avalanche
/// step so the high bits (used for shard selection) are well mixed.
#[inline]
pub fn content_hash(bytes: &[u8]) -> u64 {
    let mut hash = DJB2_SEED;
    for b in (bytes.len() as u64).to_le_bytes() {
        hash = step(hash, b);
    }
    for &b in bytes {
        hash = step(hash, b);
    }
    avalanche(hash)
}

#[inline(always)]
fn step(hash: u64, byte: u8) -> u64 {
    (hash << 5).wrapping_add(hash).wrapping_add(byte as u64)
}

// murmur3 fmix64
#[inline(always)]
fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"hellp"));
    }

    #[test]
    fn test_length_prefix_separates_zero_padding() {
        assert_ne!(content_hash(b""), content_hash(b"\0"));
        assert_ne!(content_hash(b"a"), content_hash(b"a\0"));
    }
}
