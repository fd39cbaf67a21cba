//! The fixed-width content key addressing cached blobs.

use std::fmt;

/// A 160-bit content digest identifying one cached blob.
///
/// Keys are supplied by the caller and assumed to be high-entropy content
/// digests (e.g. SHA-1 of the compiler inputs). Two blobs with the same
/// `CacheKey` are assumed identical; collision avoidance is the caller's
/// responsibility.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 20]);

impl CacheKey {
    /// Size of a key in bytes.
    pub const SIZE: usize = 20;

    /// Creates a key from its raw 20-byte digest.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derives the 64-bit lookup hash used to index this key.
    ///
    /// The hash is the little-endian reinterpretation of the first 8 bytes
    /// of the digest. It is a fast index, not an identity: every positive
    /// lookup must be confirmed by comparing the full key.
    pub fn lookup_hash(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(low)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> CacheKey {
        CacheKey::from_bytes([fill; 20])
    }

    #[test]
    fn roundtrips_raw_bytes() {
        let k = key(0xab);
        assert_eq!(k.as_bytes(), &[0xab; 20]);
    }

    #[test]
    fn lookup_hash_uses_low_eight_bytes() {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        // Trailing bytes must not affect the hash.
        bytes[8] = 0xff;
        bytes[19] = 0xff;
        let k = CacheKey::from_bytes(bytes);
        assert_eq!(k.lookup_hash(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn keys_sharing_low_bytes_collide_in_hash_space() {
        let mut a = [0x11u8; 20];
        let mut b = [0x11u8; 20];
        a[19] = 1;
        b[19] = 2;
        let (a, b) = (CacheKey::from_bytes(a), CacheKey::from_bytes(b));
        assert_ne!(a, b);
        assert_eq!(a.lookup_hash(), b.lookup_hash());
    }

    #[test]
    fn display_is_forty_hex_chars() {
        let s = format!("{}", key(0x5a));
        assert_eq!(s.len(), 40);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_abbreviated() {
        let s = format!("{:?}", key(0xcd));
        assert!(s.starts_with("CacheKey("));
        assert!(s.ends_with(")"));
    }
}
