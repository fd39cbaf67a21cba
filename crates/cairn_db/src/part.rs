//! The single-shard cache engine.
//!
//! A `Part` owns one cache file (keyed blobs) and one index file
//! (fast-lookup records), plus an in-memory hash index rebuilt from the
//! index file. Entries are append-mostly: existing entries are read-only
//! except through compaction, which rewrites both files in place. Every
//! detected structural or checksum inconsistency is resolved by wiping the
//! part back to a valid empty state ("zap") rather than attempting
//! fine-grained repair, so corruption degrades to a cold cache and never
//! to wrong data.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cairn_common::{blob_checksum, CacheKey};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::codec::{EntryHeader, FileHeader, IndexRecord, FORMAT_VERSION};
use crate::error::{DbError, DbResult};
use crate::lock::FileLockGuard;
use crate::score;

/// File name of the cache file inside a part directory.
pub const CACHE_FILE_NAME: &str = "cairn.db";

/// File name of the index file inside a part directory.
pub const INDEX_FILE_NAME: &str = "cairn.idx";

/// Per-entry fixed overhead in the cache file (the entry header).
pub const ENTRY_OVERHEAD: u64 = EntryHeader::SIZE as u64;

const HEADER_SIZE: u64 = FileHeader::SIZE as u64;

/// In-memory copy of one index record, keyed by lookup hash.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemEntry {
    /// Offset of the entry header in the cache file.
    pub(crate) cache_offset: u64,
    /// Offset of the record in the index file.
    pub(crate) index_offset: u64,
    /// Last-access time in milliseconds since the Unix epoch.
    pub(crate) last_access: u64,
    /// Blob size in bytes.
    pub(crate) size: u32,
    /// Marked during compaction snapshots; always `false` in the live map.
    pub(crate) evicted: bool,
}

/// One independently locked, file-backed shard of the cache.
///
/// A part may be shared freely between threads; every operation serializes
/// behind an in-process mutex and then takes OS advisory exclusive locks
/// on both files, so multiple processes may also operate on the same part
/// directory concurrently. Operations are synchronous and never retried
/// internally. Dropping the part closes both files.
pub struct Part {
    inner: Mutex<PartInner>,
}

pub(crate) struct PartInner {
    pub(crate) dir: PathBuf,
    pub(crate) cache_path: PathBuf,
    pub(crate) index_path: PathBuf,
    pub(crate) cache_file: File,
    pub(crate) index_file: File,
    /// Generation stamp this instance last saw committed on disk.
    pub(crate) uuid: u64,
    /// Configured size limit for the cache file, in bytes.
    pub(crate) capacity: u64,
    /// Eviction-score age-doubling period in milliseconds.
    pub(crate) score_period_ms: u64,
    /// Cleared when corruption wipes the part; the next operation
    /// re-initializes the files before proceeding.
    pub(crate) alive: bool,
    /// Lookup hash to entry metadata. At most one live entry per hash.
    pub(crate) index: HashMap<u64, MemEntry>,
    /// Index-file offset up to which records have been scanned.
    pub(crate) catchup: u64,
}

impl Part {
    /// Creates or opens the part stored in `dir`.
    ///
    /// If either file header is missing or invalid, or the generation
    /// stamps of the two files disagree, both files are reinitialized to
    /// empty under a freshly generated stamp. Otherwise the index file is
    /// scanned from the start to populate the in-memory index; a short or
    /// garbled tail record stops the scan without failing the open.
    pub fn open(dir: &Path, capacity: u64, age_double_period: Duration) -> DbResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| DbError::io(dir, e))?;
        let cache_path = dir.join(CACHE_FILE_NAME);
        let index_path = dir.join(INDEX_FILE_NAME);
        let cache_file = open_rw(&cache_path)?;
        let index_file = open_rw(&index_path)?;

        let mut inner = PartInner {
            dir: dir.to_path_buf(),
            cache_path,
            index_path,
            cache_file,
            index_file,
            uuid: 0,
            capacity,
            score_period_ms: (age_double_period.as_millis() as u64).max(1),
            alive: true,
            index: HashMap::new(),
            catchup: HEADER_SIZE,
        };

        let _locks = FileLockGuard::acquire(&inner.cache_file, &inner.index_file, &inner.dir)?;
        inner.load()?;
        drop(_locks);

        debug!(
            part = %dir.display(),
            entries = inner.index.len(),
            "opened part"
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Reads the blob stored under `key`.
    ///
    /// A successful read is always verified: the full key is compared
    /// against the stored key and the blob checksum is recomputed, so a
    /// returned blob is exactly what was written. The entry's last-access
    /// time is refreshed on disk and in memory.
    pub fn read(&self, key: &CacheKey) -> DbResult<Vec<u8>> {
        self.locked(|inner| inner.read_entry(key))
    }

    /// Appends a blob under `key`.
    ///
    /// If the write would exceed the part's capacity, least-recently-used
    /// entries are evicted first. A write whose lookup hash collides with
    /// an existing entry is refused with [`DbError::AlreadyExists`] and
    /// the existing entry is left untouched. Empty blobs are not storable.
    pub fn write(&self, key: &CacheKey, blob: &[u8]) -> DbResult<()> {
        self.locked(|inner| inner.write_entry(key, blob))
    }

    /// Removes the entry stored under `key`.
    ///
    /// Returns [`DbError::NotFound`] if the key is absent or its lookup
    /// hash matches a different key. Removal compacts both files in place,
    /// so surviving entries keep their relative order.
    pub fn remove(&self, key: &CacheKey) -> DbResult<()> {
        self.locked(|inner| inner.remove_entry(key))
    }

    /// Returns `true` if a blob of `blob_len` bytes fits without eviction.
    pub fn has_space(&self, blob_len: usize) -> DbResult<bool> {
        self.locked(|inner| {
            let end = file_end(&mut inner.cache_file, &inner.cache_path)?;
            Ok(end + ENTRY_OVERHEAD + blob_len as u64 <= inner.capacity)
        })
    }

    /// Estimates how much stale, reclaimable data this part holds.
    ///
    /// Used by the multipart router to pick a write target when every
    /// shard is full; a higher score means eviction here frees more
    /// long-unused bytes.
    pub fn eviction_score(&self) -> DbResult<f64> {
        self.locked(|inner| {
            inner.sync_stamp()?;
            inner.catch_up()?;
            Ok(score::eviction_score(
                &inner.index,
                inner.capacity,
                inner.score_period_ms,
                now_millis(),
            ))
        })
    }

    /// Runs `f` with the in-process mutex held and both files locked.
    ///
    /// Lock order is mutex, cache file, index file; the file locks are
    /// released in reverse order on every exit path. A part wiped by an
    /// earlier failure is re-initialized to empty before `f` runs.
    fn locked<T>(&self, f: impl FnOnce(&mut PartInner) -> DbResult<T>) -> DbResult<T> {
        let mut inner = self.inner.lock();
        let _locks = FileLockGuard::acquire(&inner.cache_file, &inner.index_file, &inner.dir)?;
        inner.revive()?;
        f(&mut inner)
    }
}

impl PartInner {
    /// Validates both headers and populates the in-memory index.
    ///
    /// Invalid or mismatched headers reinitialize the part to empty; this
    /// is the only place a brand-new part is born.
    fn load(&mut self) -> DbResult<()> {
        match self.disk_uuid()? {
            Some(uuid) => {
                self.uuid = uuid;
                self.index.clear();
                self.catchup = HEADER_SIZE;
                self.catch_up()
            }
            None => self.init_files(),
        }
    }

    /// Truncates both files and writes fresh headers under a new stamp.
    fn init_files(&mut self) -> DbResult<()> {
        let uuid = fresh_uuid();
        let header = FileHeader {
            version: FORMAT_VERSION,
            uuid,
        };
        self.cache_file
            .set_len(0)
            .map_err(|e| DbError::io(&self.cache_path, e))?;
        self.index_file
            .set_len(0)
            .map_err(|e| DbError::io(&self.index_path, e))?;
        write_at(&mut self.cache_file, &self.cache_path, 0, &header.encode())?;
        write_at(&mut self.index_file, &self.index_path, 0, &header.encode())?;
        self.uuid = uuid;
        self.index.clear();
        self.catchup = HEADER_SIZE;
        self.alive = true;
        debug!(part = %self.dir.display(), "initialized empty part");
        Ok(())
    }

    /// Re-initializes the files if a previous failure wiped the part.
    fn revive(&mut self) -> DbResult<()> {
        if self.alive {
            return Ok(());
        }
        self.init_files()
    }

    /// Reads both file headers and returns the committed generation stamp.
    ///
    /// `None` means the part is not in a valid committed state: a header
    /// is missing or garbled, the format version is unknown, the stamps
    /// disagree, or the in-progress-rewrite marker (stamp zero) is set.
    fn disk_uuid(&mut self) -> DbResult<Option<u64>> {
        let mut buf = [0u8; FileHeader::SIZE];
        if !read_at(&mut self.cache_file, &self.cache_path, 0, &mut buf)? {
            return Ok(None);
        }
        let cache_header = FileHeader::decode(&buf);
        if !read_at(&mut self.index_file, &self.index_path, 0, &mut buf)? {
            return Ok(None);
        }
        let index_header = FileHeader::decode(&buf);
        match (cache_header, index_header) {
            (Some(c), Some(i))
                if c.version == FORMAT_VERSION
                    && i.version == FORMAT_VERSION
                    && c.uuid == i.uuid
                    && c.uuid != 0 =>
            {
                Ok(Some(c.uuid))
            }
            _ => Ok(None),
        }
    }

    /// Brings this instance up to date with the stamp committed on disk.
    ///
    /// A stamp change means another process compacted or reinitialized the
    /// part since we last looked; the whole index is rescanned. An invalid
    /// stamp (for example the zero marker left by a crashed compaction)
    /// wipes the part.
    fn sync_stamp(&mut self) -> DbResult<()> {
        match self.disk_uuid()? {
            Some(uuid) if uuid == self.uuid => Ok(()),
            Some(_) => self
                .reload()
                .map_err(|_| self.zap("reload after stamp change failed")),
            None => Err(self.zap("invalid or mismatched file headers")),
        }
    }

    /// Re-validates both headers and rescans the index from the start.
    ///
    /// A full rescan (rather than resuming from the catch-up offset) is
    /// required to observe last-access times that peer processes rewrite
    /// in place inside already-scanned records.
    pub(crate) fn reload(&mut self) -> DbResult<()> {
        match self.disk_uuid()? {
            Some(uuid) => {
                self.uuid = uuid;
                self.index.clear();
                self.catchup = HEADER_SIZE;
                self.catch_up()
            }
            None => Err(DbError::corrupt("invalid file headers on reload")),
        }
    }

    /// Scans index records appended since the last scan into the map.
    ///
    /// Stops silently at a short or garbled tail record (the footprint of
    /// a crashed writer); the scan resumes at the same offset next time,
    /// and the next write truncates the tail away. Entries scanned before
    /// the tail stay live.
    pub(crate) fn catch_up(&mut self) -> DbResult<()> {
        loop {
            let mut buf = [0u8; IndexRecord::SIZE];
            if !read_at(&mut self.index_file, &self.index_path, self.catchup, &mut buf)? {
                return Ok(());
            }
            let record = IndexRecord::decode(&buf);
            if record.size == 0 || record.cache_offset < HEADER_SIZE {
                // A full-width but structurally impossible record is still
                // just a crashed writer's tail, not trusted state.
                return Ok(());
            }
            let index_offset = self.catchup;
            self.catchup += IndexRecord::SIZE as u64;
            self.index.insert(
                record.hash,
                MemEntry {
                    cache_offset: record.cache_offset,
                    index_offset,
                    last_access: record.last_access,
                    size: record.size,
                    evicted: false,
                },
            );
        }
    }

    fn read_entry(&mut self, key: &CacheKey) -> DbResult<Vec<u8>> {
        self.sync_stamp()?;
        self.catch_up()?;

        let hash = key.lookup_hash();
        let entry = match self.index.get(&hash) {
            Some(entry) => *entry,
            None => return Err(DbError::NotFound),
        };

        let mut header_buf = [0u8; EntryHeader::SIZE];
        if !read_at(
            &mut self.cache_file,
            &self.cache_path,
            entry.cache_offset,
            &mut header_buf,
        )? {
            return Err(self.zap("cache entry header past end of file"));
        }
        let header = EntryHeader::decode(&header_buf);
        if !header.is_well_formed() {
            return Err(self.zap("malformed cache entry header"));
        }
        if header.key != *key {
            // Lookup-hash collision with a different key: an ordinary miss.
            return Err(DbError::NotFound);
        }

        // Bound the allocation before trusting the size field.
        let end = file_end(&mut self.cache_file, &self.cache_path)?;
        if entry.cache_offset + ENTRY_OVERHEAD + header.size as u64 > end {
            return Err(self.zap("cache entry extends past end of file"));
        }

        let mut blob = vec![0u8; header.size as usize];
        if !read_at(
            &mut self.cache_file,
            &self.cache_path,
            entry.cache_offset + ENTRY_OVERHEAD,
            &mut blob,
        )? {
            return Err(self.zap("cache entry blob truncated"));
        }
        if blob_checksum(&blob) != header.checksum {
            return Err(self.zap("blob checksum mismatch"));
        }

        // Guard against a racing external writer: the on-disk record must
        // still agree with the copy we trusted for the seek.
        let mut record_buf = [0u8; IndexRecord::SIZE];
        if !read_at(
            &mut self.index_file,
            &self.index_path,
            entry.index_offset,
            &mut record_buf,
        )? {
            return Err(self.zap("index record past end of file"));
        }
        let record = IndexRecord::decode(&record_buf);
        if record.cache_offset != entry.cache_offset || record.size != entry.size {
            return Err(self.zap("index record changed under a concurrent writer"));
        }

        let now = now_millis();
        let touched = IndexRecord {
            hash,
            size: entry.size,
            last_access: now,
            cache_offset: entry.cache_offset,
        };
        write_at(
            &mut self.index_file,
            &self.index_path,
            entry.index_offset,
            &touched.encode(),
        )?;
        if let Some(live) = self.index.get_mut(&hash) {
            live.last_access = now;
        }

        Ok(blob)
    }

    fn write_entry(&mut self, key: &CacheKey, blob: &[u8]) -> DbResult<()> {
        if blob.is_empty() {
            return Err(DbError::io(
                &self.cache_path,
                io::Error::new(io::ErrorKind::InvalidInput, "empty blobs are not storable"),
            ));
        }
        if blob.len() > u32::MAX as usize {
            return Err(DbError::io(
                &self.cache_path,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "blob exceeds the 32-bit size field",
                ),
            ));
        }
        self.sync_stamp()?;

        let needed = ENTRY_OVERHEAD + blob.len() as u64;
        let end = file_end(&mut self.cache_file, &self.cache_path)?;
        if end + needed > self.capacity {
            // Freeing half the capacity in one pass doubles as the
            // periodic LRU sweep.
            let goal = needed.max(self.capacity / 2);
            self.compact(goal, None)?;
        } else {
            self.catch_up()?;
        }

        let hash = key.lookup_hash();
        if self.index.contains_key(&hash) {
            return Err(DbError::AlreadyExists);
        }

        let header = EntryHeader {
            key: *key,
            checksum: blob_checksum(blob),
            size: blob.len() as u32,
        };
        let cache_offset = file_end(&mut self.cache_file, &self.cache_path)?;
        write_at(
            &mut self.cache_file,
            &self.cache_path,
            cache_offset,
            &header.encode(),
        )?;
        write_at(
            &mut self.cache_file,
            &self.cache_path,
            cache_offset + ENTRY_OVERHEAD,
            blob,
        )?;

        // Drop any partial record a crashed writer left at the tail, so
        // the valid prefix stays a whole multiple of the record size.
        let index_end = file_end(&mut self.index_file, &self.index_path)?;
        if index_end > self.catchup {
            self.index_file
                .set_len(self.catchup)
                .map_err(|e| DbError::io(&self.index_path, e))?;
        }

        let now = now_millis();
        let record = IndexRecord {
            hash,
            size: header.size,
            last_access: now,
            cache_offset,
        };
        let index_offset = self.catchup;
        write_at(
            &mut self.index_file,
            &self.index_path,
            index_offset,
            &record.encode(),
        )?;
        self.catchup = index_offset + IndexRecord::SIZE as u64;
        self.index.insert(
            hash,
            MemEntry {
                cache_offset,
                index_offset,
                last_access: now,
                size: header.size,
                evicted: false,
            },
        );
        Ok(())
    }

    fn remove_entry(&mut self, key: &CacheKey) -> DbResult<()> {
        self.sync_stamp()?;
        self.catch_up()?;

        let hash = key.lookup_hash();
        let entry = match self.index.get(&hash) {
            Some(entry) => *entry,
            None => return Err(DbError::NotFound),
        };

        let mut header_buf = [0u8; EntryHeader::SIZE];
        if !read_at(
            &mut self.cache_file,
            &self.cache_path,
            entry.cache_offset,
            &mut header_buf,
        )? {
            return Err(self.zap("cache entry header past end of file"));
        }
        let header = EntryHeader::decode(&header_buf);
        if !header.is_well_formed() {
            return Err(self.zap("malformed cache entry header"));
        }
        if header.key != *key {
            return Err(DbError::NotFound);
        }

        self.compact(0, Some(hash))
    }

    /// Wipes the part back to a valid-empty state and reports corruption.
    ///
    /// Both files are truncated to zero length and the part is marked not
    /// alive for the remainder of the failed call; the next operation (or
    /// open) re-initializes the files and proceeds against an empty cache.
    pub(crate) fn zap(&mut self, reason: &str) -> DbError {
        warn!(part = %self.dir.display(), reason, "wiping corrupt part");
        let _ = self.cache_file.set_len(0);
        let _ = self.index_file.set_len(0);
        self.index.clear();
        self.uuid = 0;
        self.catchup = HEADER_SIZE;
        self.alive = false;
        DbError::corrupt(reason)
    }
}

/// Returns the current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generates a non-zero generation stamp.
pub(crate) fn fresh_uuid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let uuid: u64 = rng.gen();
        if uuid != 0 {
            return uuid;
        }
    }
}

fn open_rw(path: &Path) -> DbResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| DbError::io(path, e))
}

/// Reads `buf.len()` bytes at `offset`, returning `false` on a short read.
///
/// A short read is the tolerated partial-record case; any other failure
/// is a real I/O error.
pub(crate) fn read_at(
    file: &mut File,
    path: &Path,
    offset: u64,
    buf: &mut [u8],
) -> DbResult<bool> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| DbError::io(path, e))?;
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(DbError::io(path, e)),
    }
}

/// Writes all of `buf` at `offset`.
pub(crate) fn write_at(file: &mut File, path: &Path, offset: u64, buf: &[u8]) -> DbResult<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| DbError::io(path, e))?;
    file.write_all(buf).map_err(|e| DbError::io(path, e))?;
    file.flush().map_err(|e| DbError::io(path, e))
}

/// Returns the current length of the file.
pub(crate) fn file_end(file: &mut File, path: &Path) -> DbResult<u64> {
    file.seek(SeekFrom::End(0)).map_err(|e| DbError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn key(id: u64) -> CacheKey {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        bytes[8] = 0x5c;
        CacheKey::from_bytes(bytes)
    }

    fn open_part(dir: &Path, capacity: u64) -> Part {
        Part::open(dir, capacity, 30 * DAY).unwrap()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);

        let blob = b"compiled artifact bytes".to_vec();
        part.write(&key(1), &blob).unwrap();
        assert_eq!(part.read(&key(1)).unwrap(), blob);
    }

    #[test]
    fn read_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        assert!(matches!(part.read(&key(7)), Err(DbError::NotFound)));
    }

    #[test]
    fn duplicate_write_is_refused_and_first_blob_survives() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);

        part.write(&key(1), b"first").unwrap();
        assert!(matches!(
            part.write(&key(1), b"second"),
            Err(DbError::AlreadyExists)
        ));
        assert_eq!(part.read(&key(1)).unwrap(), b"first");
    }

    #[test]
    fn colliding_lookup_hash_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);

        // Same first 8 bytes, different full key.
        let mut a = [0x42u8; 20];
        let mut b = [0x42u8; 20];
        a[19] = 1;
        b[19] = 2;
        let (a, b) = (CacheKey::from_bytes(a), CacheKey::from_bytes(b));

        part.write(&a, b"held by a").unwrap();
        assert!(matches!(part.write(&b, b"wants in"), Err(DbError::AlreadyExists)));

        // The collision surfaces as a plain miss on read, not corruption.
        assert!(matches!(part.read(&b), Err(DbError::NotFound)));
        assert_eq!(part.read(&a).unwrap(), b"held by a");
    }

    #[test]
    fn empty_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        assert!(part.write(&key(1), b"").is_err());
    }

    #[test]
    fn oversized_blob_is_refused_without_damage() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        part.write(&key(1), b"kept").unwrap();

        // The length check fires before any hashing, I/O, or eviction, so
        // the zeroed pages are never touched and the part is untouched.
        let huge = vec![0u8; u32::MAX as usize + 1];
        assert!(part.write(&key(2), &huge).is_err());

        assert_eq!(part.read(&key(1)).unwrap(), b"kept");
        assert!(matches!(part.read(&key(2)), Err(DbError::NotFound)));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let part = open_part(dir.path(), 1 << 20);
            part.write(&key(1), b"persisted").unwrap();
        }
        let part = open_part(dir.path(), 1 << 20);
        assert_eq!(part.read(&key(1)).unwrap(), b"persisted");
    }

    #[test]
    fn remove_then_read_misses() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);

        part.write(&key(1), b"doomed").unwrap();
        part.write(&key(2), b"survivor").unwrap();
        part.remove(&key(1)).unwrap();

        assert!(matches!(part.read(&key(1)), Err(DbError::NotFound)));
        assert_eq!(part.read(&key(2)).unwrap(), b"survivor");
    }

    #[test]
    fn remove_absent_key_leaves_part_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        part.write(&key(1), b"stays").unwrap();

        let cache_len = std::fs::metadata(dir.path().join(CACHE_FILE_NAME))
            .unwrap()
            .len();
        let index_len = std::fs::metadata(dir.path().join(INDEX_FILE_NAME))
            .unwrap()
            .len();

        assert!(matches!(part.remove(&key(9)), Err(DbError::NotFound)));

        assert_eq!(
            std::fs::metadata(dir.path().join(CACHE_FILE_NAME))
                .unwrap()
                .len(),
            cache_len
        );
        assert_eq!(
            std::fs::metadata(dir.path().join(INDEX_FILE_NAME))
                .unwrap()
                .len(),
            index_len
        );
        assert_eq!(part.read(&key(1)).unwrap(), b"stays");
    }

    #[test]
    fn remove_with_colliding_hash_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);

        let mut a = [0x42u8; 20];
        let mut b = [0x42u8; 20];
        a[19] = 1;
        b[19] = 2;
        let (a, b) = (CacheKey::from_bytes(a), CacheKey::from_bytes(b));

        part.write(&a, b"held by a").unwrap();
        assert!(matches!(part.remove(&b), Err(DbError::NotFound)));
        assert_eq!(part.read(&a).unwrap(), b"held by a");
    }

    #[test]
    fn eviction_keeps_size_under_capacity_and_prefers_recent() {
        let dir = tempfile::tempdir().unwrap();
        let capacity = 1000;
        let part = open_part(dir.path(), capacity);

        // 7 entries of 128 bytes each (100-byte blob + header) fit under
        // the 1000-byte capacity; the 8th write must evict.
        for i in 0..7u64 {
            part.write(&key(i), &[i as u8; 100]).unwrap();
            std::thread::sleep(Duration::from_millis(3));
        }

        // Touch the oldest entry so it outranks entries 1..=4 in the LRU.
        part.read(&key(0)).unwrap();
        std::thread::sleep(Duration::from_millis(3));

        part.write(&key(7), &[7u8; 100]).unwrap();

        let cache_len = std::fs::metadata(dir.path().join(CACHE_FILE_NAME))
            .unwrap()
            .len();
        assert!(cache_len <= capacity, "cache file still over capacity");

        // The touched entry and the new entry survive; the least recently
        // used entries were evicted.
        assert_eq!(part.read(&key(0)).unwrap(), [0u8; 100]);
        assert_eq!(part.read(&key(7)).unwrap(), [7u8; 100]);
        assert!(matches!(part.read(&key(1)), Err(DbError::NotFound)));
        assert!(matches!(part.read(&key(2)), Err(DbError::NotFound)));
    }

    #[test]
    fn corrupt_blob_heals_to_empty_working_part() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        part.write(&key(1), b"about to be damaged").unwrap();

        // Flip one byte inside the stored blob.
        let cache_path = dir.path().join(CACHE_FILE_NAME);
        let mut bytes = std::fs::read(&cache_path).unwrap();
        let blob_start = FileHeader::SIZE + EntryHeader::SIZE;
        bytes[blob_start + 3] ^= 0xff;
        std::fs::write(&cache_path, &bytes).unwrap();

        assert!(matches!(part.read(&key(1)), Err(DbError::Corrupt { .. })));

        // The part self-heals: a fresh write/read cycle succeeds.
        part.write(&key(2), b"fresh start").unwrap();
        assert_eq!(part.read(&key(2)).unwrap(), b"fresh start");
        assert!(matches!(part.read(&key(1)), Err(DbError::NotFound)));
    }

    #[test]
    fn zero_stamp_resets_part_on_next_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let part = open_part(dir.path(), 1 << 20);
            part.write(&key(1), b"pre-crash").unwrap();
        }

        // Simulate a crash right after the dirty marker was stamped: zero
        // out the generation stamp in the cache file header.
        let cache_path = dir.path().join(CACHE_FILE_NAME);
        let mut bytes = std::fs::read(&cache_path).unwrap();
        bytes[12..20].fill(0);
        std::fs::write(&cache_path, &bytes).unwrap();

        let part = open_part(dir.path(), 1 << 20);
        assert!(matches!(part.read(&key(1)), Err(DbError::NotFound)));
        part.write(&key(2), b"post-recovery").unwrap();
        assert_eq!(part.read(&key(2)).unwrap(), b"post-recovery");
    }

    #[test]
    fn mismatched_stamps_reset_part_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let part = open_part(dir.path(), 1 << 20);
            part.write(&key(1), b"stale").unwrap();
        }

        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut bytes = std::fs::read(&index_path).unwrap();
        bytes[12] ^= 0x01;
        std::fs::write(&index_path, &bytes).unwrap();

        let part = open_part(dir.path(), 1 << 20);
        assert!(matches!(part.read(&key(1)), Err(DbError::NotFound)));
    }

    #[test]
    fn garbled_index_tail_is_tolerated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let part = open_part(dir.path(), 1 << 20);
            part.write(&key(1), b"alpha").unwrap();
            part.write(&key(2), b"beta").unwrap();
        }

        // A crashed writer leaves a short record at the index tail.
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut bytes = std::fs::read(&index_path).unwrap();
        bytes.extend_from_slice(&[0xaa; 11]);
        std::fs::write(&index_path, &bytes).unwrap();

        let part = open_part(dir.path(), 1 << 20);
        assert_eq!(part.read(&key(1)).unwrap(), b"alpha");
        assert_eq!(part.read(&key(2)).unwrap(), b"beta");

        // The next write replaces the partial tail and stays readable.
        part.write(&key(3), b"gamma").unwrap();
        assert_eq!(part.read(&key(3)).unwrap(), b"gamma");
    }

    #[test]
    fn zeroed_full_width_index_tail_is_tolerated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let part = open_part(dir.path(), 1 << 20);
            part.write(&key(1), b"alpha").unwrap();
            part.write(&key(2), b"beta").unwrap();
        }

        // A crashed writer can also leave a complete record of zeroes
        // (allocated but never filled). It must end the scan like a short
        // tail, not destroy the part.
        let index_path = dir.path().join(INDEX_FILE_NAME);
        let mut bytes = std::fs::read(&index_path).unwrap();
        bytes.extend_from_slice(&[0u8; IndexRecord::SIZE]);
        std::fs::write(&index_path, &bytes).unwrap();

        let part = open_part(dir.path(), 1 << 20);
        assert_eq!(part.read(&key(1)).unwrap(), b"alpha");
        assert_eq!(part.read(&key(2)).unwrap(), b"beta");

        // The next write truncates the garbled tail away.
        part.write(&key(3), b"gamma").unwrap();
        assert_eq!(part.read(&key(3)).unwrap(), b"gamma");
        assert_eq!(part.read(&key(1)).unwrap(), b"alpha");
    }

    #[test]
    fn second_instance_catches_up_on_peer_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_part(dir.path(), 1 << 20);
        let reader = open_part(dir.path(), 1 << 20);

        writer.write(&key(1), b"seen across instances").unwrap();
        assert_eq!(reader.read(&key(1)).unwrap(), b"seen across instances");
    }

    #[test]
    fn second_instance_reloads_after_peer_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_part(dir.path(), 1 << 20);
        let b = open_part(dir.path(), 1 << 20);

        a.write(&key(1), b"one").unwrap();
        a.write(&key(2), b"two").unwrap();
        assert_eq!(b.read(&key(2)).unwrap(), b"two");

        // Compaction through `a` changes the generation stamp; `b` must
        // reload rather than trust its remembered offsets.
        a.remove(&key(1)).unwrap();
        assert_eq!(b.read(&key(2)).unwrap(), b"two");
        assert!(matches!(b.read(&key(1)), Err(DbError::NotFound)));
    }

    #[test]
    fn has_space_tracks_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 200);

        assert!(part.has_space(100).unwrap());
        part.write(&key(1), &[1u8; 100]).unwrap();
        assert!(!part.has_space(100).unwrap());
    }

    #[test]
    fn eviction_score_rises_with_stale_data() {
        let dir = tempfile::tempdir().unwrap();
        let stale = Part::open(&dir.path().join("stale"), 1 << 20, Duration::from_millis(5))
            .unwrap();
        let fresh = Part::open(&dir.path().join("fresh"), 1 << 20, Duration::from_millis(5))
            .unwrap();

        stale.write(&key(1), &[1u8; 100]).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        fresh.write(&key(2), &[2u8; 100]).unwrap();

        let stale_score = stale.eviction_score().unwrap();
        let fresh_score = fresh.eviction_score().unwrap();
        assert!(
            stale_score > fresh_score,
            "stale part must outscore fresh part ({stale_score} vs {fresh_score})"
        );
    }

    #[test]
    fn eviction_score_tracks_peer_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_part(dir.path(), 1 << 20);
        let b = open_part(dir.path(), 1 << 20);

        a.write(&key(1), &[1u8; 100]).unwrap();
        a.write(&key(2), &[2u8; 100]).unwrap();
        let before = b.eviction_score().unwrap();

        // Compaction through `a` rewrites both files under a new stamp;
        // `b` must rescore against the reloaded state, not its stale map.
        a.remove(&key(1)).unwrap();
        let after = b.eviction_score().unwrap();
        assert!(
            after < before * 0.75,
            "score must drop after a peer evicts ({before} vs {after})"
        );
    }

    #[test]
    fn empty_part_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), 1 << 20);
        assert_eq!(part.eviction_score().unwrap(), 0.0);
    }
}
