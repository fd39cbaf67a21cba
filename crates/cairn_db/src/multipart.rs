//! The multipart router sharding the cache across independent parts.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cairn_common::CacheKey;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::part::{Part, CACHE_FILE_NAME, INDEX_FILE_NAME};

/// Default number of parts a database is split into.
pub const DEFAULT_PART_COUNT: usize = 50;

/// Default eviction-score age-doubling period.
pub const DEFAULT_AGE_DOUBLE_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Programmatic configuration for opening a [`MultipartDb`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Total capacity in bytes, split evenly across all parts.
    pub capacity_bytes: u64,

    /// Number of independently locked parts. One part degenerates the
    /// router to a single shard.
    pub part_count: usize,

    /// Period over which an untouched entry's eviction-score weight
    /// doubles.
    pub age_double_period: Duration,
}

impl DbOptions {
    /// Creates options with the given total capacity and defaults for
    /// everything else.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            part_count: DEFAULT_PART_COUNT,
            age_double_period: DEFAULT_AGE_DOUBLE_PERIOD,
        }
    }

    /// Sets the number of parts.
    pub fn part_count(mut self, part_count: usize) -> Self {
        self.part_count = part_count;
        self
    }

    /// Sets the eviction-score age-doubling period.
    pub fn age_double_period(mut self, period: Duration) -> Self {
        self.age_double_period = period;
        self
    }
}

/// A cache database sharded across independently locked parts.
///
/// Each part lives in its own subdirectory with an even share of the
/// total capacity. Reads and writes probe parts round-robin starting from
/// the last part that served them, so consecutive operations keep
/// locality with cheap single-shard locking; removal fans out to every
/// part because a key's shard is not predictable. Dropping the database
/// closes every part.
pub struct MultipartDb {
    parts: Vec<Part>,
    last_read: AtomicUsize,
    last_write: AtomicUsize,
}

impl MultipartDb {
    /// Creates or opens a sharded database rooted at `root`.
    ///
    /// Any pre-sharding single-part files found directly at `root` are
    /// deleted: migration is one-way and old data is discarded, not
    /// merged.
    pub fn open(root: &Path, options: DbOptions) -> DbResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| DbError::io(root, e))?;

        let part_count = options.part_count.max(1);
        let per_part_capacity = options.capacity_bytes / part_count as u64;
        let mut parts = Vec::with_capacity(part_count);
        for i in 0..part_count {
            parts.push(Part::open(
                &root.join(format!("part{i}")),
                per_part_capacity,
                options.age_double_period,
            )?);
        }

        for stale in [CACHE_FILE_NAME, INDEX_FILE_NAME] {
            let path = root.join(stale);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| DbError::io(&path, e))?;
                debug!(path = %path.display(), "removed pre-sharding database file");
            }
        }

        Ok(Self {
            parts,
            last_read: AtomicUsize::new(0),
            last_write: AtomicUsize::new(0),
        })
    }

    /// Returns the number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Reads the blob stored under `key` from whichever part holds it.
    ///
    /// Parts are probed round-robin starting at the last part that
    /// produced a hit. A part that reports corruption has already healed
    /// itself to empty and is skipped like a miss.
    pub fn read(&self, key: &CacheKey) -> DbResult<Vec<u8>> {
        let start = self.last_read.load(Ordering::Relaxed);
        for probe in 0..self.parts.len() {
            let idx = (start + probe) % self.parts.len();
            match self.parts[idx].read(key) {
                Ok(blob) => {
                    self.last_read.store(idx, Ordering::Relaxed);
                    return Ok(blob);
                }
                Err(DbError::NotFound) | Err(DbError::Corrupt { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DbError::NotFound)
    }

    /// Writes a blob to the first part with free space.
    ///
    /// Parts are probed round-robin starting at the last part written to.
    /// If no part has space, the write goes unconditionally to the part
    /// holding the most stale, reclaimable data, which forces that part's
    /// own eviction to run.
    pub fn write(&self, key: &CacheKey, blob: &[u8]) -> DbResult<()> {
        let start = self.last_write.load(Ordering::Relaxed);
        for probe in 0..self.parts.len() {
            let idx = (start + probe) % self.parts.len();
            // A part that fails the space check is skipped; the write
            // only fails once no part will take it.
            if let Ok(true) = self.parts[idx].has_space(blob.len()) {
                self.last_write.store(idx, Ordering::Relaxed);
                return self.parts[idx].write(key, blob);
            }
        }

        let mut best = 0;
        let mut best_score = f64::MIN;
        for (idx, part) in self.parts.iter().enumerate() {
            if let Ok(score) = part.eviction_score() {
                if score > best_score {
                    best_score = score;
                    best = idx;
                }
            }
        }
        self.last_write.store(best, Ordering::Relaxed);
        self.parts[best].write(key, blob)
    }

    /// Removes `key` from every part that holds it.
    ///
    /// Succeeds if any part reported the key removed; returns
    /// [`DbError::NotFound`] if none did.
    pub fn remove(&self, key: &CacheKey) -> DbResult<()> {
        let mut removed = false;
        for part in &self.parts {
            match part.remove(key) {
                Ok(()) => removed = true,
                Err(DbError::NotFound) | Err(DbError::Corrupt { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if removed {
            Ok(())
        } else {
            Err(DbError::NotFound)
        }
    }
}
