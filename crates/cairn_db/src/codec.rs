//! Fixed-layout (de)serialization of the on-disk record shapes.
//!
//! Every record is a fixed-width, little-endian sequence of fields with no
//! padding; the structs here are (de)serialized through explicit encode and
//! decode functions only, never through in-memory layout. A successful
//! write always produces a whole record; a partial record can exist only
//! as the tail of a crash-truncated file, and readers treat such a tail as
//! "no record" rather than an error.

use cairn_common::CacheKey;

/// Magic bytes identifying a Cairn database file (cache or index).
pub const FILE_MAGIC: [u8; 8] = *b"CAIRNDB\0";

/// Current on-disk format version. Increment on breaking layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Header at the start of both the cache file and the index file.
///
/// Both files of a part must carry the same non-zero generation stamp; a
/// mismatch, or a stamp of zero, means the part is not in a valid
/// committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version of the file.
    pub version: u32,

    /// Generation stamp ("uuid") shared by the part's two files. Zero is
    /// reserved as the in-progress-rewrite marker and never a valid stamp.
    pub uuid: u64,
}

impl FileHeader {
    /// Encoded size in bytes: magic + version + uuid.
    pub const SIZE: usize = 8 + 4 + 8;

    /// Encodes the header, including the magic bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&FILE_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.uuid.to_le_bytes());
        buf
    }

    /// Decodes a header, returning `None` if the magic bytes are wrong.
    ///
    /// Version and stamp validity are checked by the caller; this only
    /// establishes that the bytes are shaped like a header at all.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Option<Self> {
        if buf[..8] != FILE_MAGIC {
            return None;
        }
        Some(Self {
            version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            uuid: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// Header preceding each blob in the cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Full content key of the blob.
    pub key: CacheKey,

    /// Checksum of the blob bytes. Never zero in a well-formed entry.
    pub checksum: u32,

    /// Length of the blob in bytes. Never zero in a well-formed entry.
    pub size: u32,
}

impl EntryHeader {
    /// Encoded size in bytes: key + checksum + size.
    pub const SIZE: usize = CacheKey::SIZE + 4 + 4;

    /// Encodes the entry header.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..20].copy_from_slice(self.key.as_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..28].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decodes an entry header.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut key = [0u8; 20];
        key.copy_from_slice(&buf[..20]);
        Self {
            key: CacheKey::from_bytes(key),
            checksum: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            size: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        }
    }

    /// Returns `true` if the size and checksum fields are plausible.
    ///
    /// Both fields are non-zero in every entry the engine writes, so a
    /// zero in either is a malformed entry.
    pub fn is_well_formed(&self) -> bool {
        self.size != 0 && self.checksum != 0
    }
}

/// One fast-lookup record in the index file.
///
/// Index records are appended in lockstep with cache entries (record *i*
/// describes cache entry *i*) and rewritten in place only by compaction
/// and by the LRU touch on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Lookup hash of the entry's key.
    pub hash: u64,

    /// Blob size in bytes, mirroring the cache entry header.
    pub size: u32,

    /// Last-access wall-clock time in milliseconds since the Unix epoch.
    pub last_access: u64,

    /// Byte offset of the matching entry header in the cache file.
    pub cache_offset: u64,
}

impl IndexRecord {
    /// Encoded size in bytes: hash + size + last access + offset.
    pub const SIZE: usize = 8 + 4 + 8 + 8;

    /// Encodes the index record.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.hash.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.last_access.to_le_bytes());
        buf[20..28].copy_from_slice(&self.cache_offset.to_le_bytes());
        buf
    }

    /// Decodes an index record.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            hash: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            last_access: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            cache_offset: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        }
    }
}
