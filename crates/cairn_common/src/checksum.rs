//! Blob integrity checksum.

/// Computes the 32-bit integrity checksum of a blob using XXH32.
///
/// A checksum of zero is reserved to mean "malformed entry", so the rare
/// input that hashes to zero is mapped to one. The same function is used
/// when stamping an entry on write and when verifying it on read, so the
/// mapping is transparent to callers.
pub fn blob_checksum(data: &[u8]) -> u32 {
    match xxhash_rust::xxh32::xxh32(data, 0) {
        0 => 1,
        sum => sum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(blob_checksum(b"payload"), blob_checksum(b"payload"));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(blob_checksum(b"payload a"), blob_checksum(b"payload b"));
    }

    #[test]
    fn never_zero() {
        assert_ne!(blob_checksum(b""), 0);
        assert_ne!(blob_checksum(b"x"), 0);
    }
}
