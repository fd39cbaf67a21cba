//! Scoped cross-process locking for a part's file pair.

use std::fs::File;
use std::path::Path;

use fs2::FileExt;

use crate::error::{DbError, DbResult};

/// RAII guard holding OS advisory exclusive locks on a part's two files.
///
/// Locks are taken cache file first, then index file, and released in
/// reverse order on drop, so every exit path (including error paths)
/// releases both. The guard works on duplicated handles: an advisory lock
/// belongs to the open file description, which the duplicates share with
/// the part's long-lived handles, so locking a duplicate locks the part's
/// files. Threads of the same process share that description too, which is
/// why the part additionally serializes operations behind an in-process
/// mutex.
pub struct FileLockGuard {
    cache: File,
    index: File,
}

impl FileLockGuard {
    /// Blocks until exclusive locks are held on both files.
    pub fn acquire(cache: &File, index: &File, dir: &Path) -> DbResult<Self> {
        let cache = cache.try_clone().map_err(|e| DbError::io(dir, e))?;
        let index = index.try_clone().map_err(|e| DbError::io(dir, e))?;
        // Trait-qualified throughout: std's inherent `File::unlock` would
        // otherwise shadow the fs2 method.
        FileExt::lock_exclusive(&cache).map_err(|e| DbError::io(dir, e))?;
        if let Err(e) = FileExt::lock_exclusive(&index) {
            let _ = FileExt::unlock(&cache);
            return Err(DbError::io(dir, e));
        }
        Ok(Self { cache, index })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Reverse acquisition order. Nothing useful to do on failure here.
        let _ = FileExt::unlock(&self.index);
        let _ = FileExt::unlock(&self.cache);
    }
}
