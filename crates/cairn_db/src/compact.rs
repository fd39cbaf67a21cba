//! In-place streaming compaction.
//!
//! Compaction removes a chosen subset of entries (by LRU age and/or by
//! explicit mark) and rewrites both files smaller without a temporary
//! file. Crash safety comes from a dirty marker: a zero generation stamp
//! is written into both headers before any data moves, so a process that
//! dies mid-rewrite leaves a part that every future opener refuses to
//! trust and wipes. Survivors only ever move toward the start of the
//! file, so the write cursor never passes the read cursor.

use std::fs::File;

use tracing::debug;

use crate::codec::{EntryHeader, FileHeader, IndexRecord, FORMAT_VERSION};
use crate::error::{DbError, DbResult};
use crate::part::{
    file_end, fresh_uuid, read_at, write_at, MemEntry, PartInner, ENTRY_OVERHEAD,
};

const HEADER_SIZE: u64 = FileHeader::SIZE as u64;

/// One snapshot entry being considered for eviction.
struct Candidate {
    hash: u64,
    entry: MemEntry,
}

impl PartInner {
    /// Evicts entries until at least `free_target` bytes are reclaimed,
    /// plus the entry with lookup hash `removed` if one is given.
    ///
    /// Explicit removal always evicts its entry regardless of the byte
    /// target; LRU-driven eviction walks entries oldest first until the
    /// target is met or nothing is left. Both files are then rewritten in
    /// place and committed under a fresh generation stamp.
    pub(crate) fn compact(&mut self, free_target: u64, removed: Option<u64>) -> DbResult<()> {
        // LRU-driven eviction must rank on timestamps peers may have
        // rewritten in place, which only a full reload can observe. An
        // explicit single-entry removal already ran catch-up.
        if removed.is_none() {
            match self.reload() {
                Ok(()) => {}
                Err(DbError::Corrupt { reason }) => return Err(self.zap(&reason)),
                Err(e) => return Err(e),
            }
        }

        let mut candidates: Vec<Candidate> = self
            .index
            .iter()
            .map(|(hash, entry)| Candidate {
                hash: *hash,
                entry: *entry,
            })
            .collect();

        // Mark pass: oldest first until enough bytes are reclaimed.
        candidates.sort_by_key(|c| c.entry.last_access);
        let mut freed = 0u64;
        for candidate in candidates.iter_mut() {
            if removed == Some(candidate.hash) {
                candidate.entry.evicted = true;
                continue;
            }
            if freed >= free_target {
                continue;
            }
            candidate.entry.evicted = true;
            freed += ENTRY_OVERHEAD + candidate.entry.size as u64;
        }

        // The rewrite streams both files in storage order.
        candidates.sort_by_key(|c| c.entry.cache_offset);
        for pair in candidates.windows(2) {
            if pair[0].entry.cache_offset == pair[1].entry.cache_offset {
                return Err(self.zap("two index entries share one cache offset"));
            }
        }

        // Dirty marker: a zero stamp invalidates the part until commit,
        // so a crash mid-rewrite can never be mistaken for a valid state.
        let dirty = FileHeader {
            version: FORMAT_VERSION,
            uuid: 0,
        };
        write_at(&mut self.cache_file, &self.cache_path, 0, &dirty.encode())?;
        write_at(&mut self.index_file, &self.index_path, 0, &dirty.encode())?;

        let (cache_len, index_len) = self.rewrite(&candidates)?;

        self.cache_file
            .set_len(cache_len)
            .map_err(|e| DbError::io(&self.cache_path, e))?;
        self.index_file
            .set_len(index_len)
            .map_err(|e| DbError::io(&self.index_path, e))?;

        // Commit point: real headers under a fresh stamp.
        let committed = FileHeader {
            version: FORMAT_VERSION,
            uuid: fresh_uuid(),
        };
        write_at(
            &mut self.cache_file,
            &self.cache_path,
            0,
            &committed.encode(),
        )?;
        write_at(
            &mut self.index_file,
            &self.index_path,
            0,
            &committed.encode(),
        )?;
        self.uuid = committed.uuid;

        debug!(
            part = %self.dir.display(),
            survivors = candidates.iter().filter(|c| !c.entry.evicted).count(),
            evicted = candidates.iter().filter(|c| c.entry.evicted).count(),
            cache_len,
            "compacted part"
        );

        // Rebuild the in-memory index from the compacted files.
        self.index.clear();
        self.catchup = HEADER_SIZE;
        self.catch_up()
    }

    /// Streams survivors down to the compacted write cursors.
    ///
    /// Reads go through a second pair of handles so the part's own handles
    /// can hold the write cursors. Returns the new lengths of the cache
    /// and index files.
    fn rewrite(&mut self, candidates: &[Candidate]) -> DbResult<(u64, u64)> {
        let mut read_cache =
            File::open(&self.cache_path).map_err(|e| DbError::io(&self.cache_path, e))?;
        let mut read_index =
            File::open(&self.index_path).map_err(|e| DbError::io(&self.index_path, e))?;

        let mut cache_cursor = HEADER_SIZE;
        let mut index_cursor = HEADER_SIZE;

        for candidate in candidates {
            let mut header_buf = [0u8; EntryHeader::SIZE];
            if !read_at(
                &mut read_cache,
                &self.cache_path,
                candidate.entry.cache_offset,
                &mut header_buf,
            )? {
                return Err(self.zap("cache entry vanished during compaction"));
            }
            let header = EntryHeader::decode(&header_buf);
            if !header.is_well_formed() || header.size != candidate.entry.size {
                return Err(self.zap("corrupt cache entry during compaction"));
            }

            let mut record_buf = [0u8; IndexRecord::SIZE];
            if !read_at(
                &mut read_index,
                &self.index_path,
                candidate.entry.index_offset,
                &mut record_buf,
            )? {
                return Err(self.zap("index record vanished during compaction"));
            }
            let record = IndexRecord::decode(&record_buf);

            if candidate.entry.evicted {
                continue;
            }

            let end = file_end(&mut read_cache, &self.cache_path)?;
            if candidate.entry.cache_offset + ENTRY_OVERHEAD + header.size as u64 > end {
                return Err(self.zap("cache entry extends past end of file"));
            }

            let mut blob = vec![0u8; header.size as usize];
            if !read_at(
                &mut read_cache,
                &self.cache_path,
                candidate.entry.cache_offset + ENTRY_OVERHEAD,
                &mut blob,
            )? {
                return Err(self.zap("cache entry blob truncated during compaction"));
            }

            write_at(
                &mut self.cache_file,
                &self.cache_path,
                cache_cursor,
                &header_buf,
            )?;
            write_at(
                &mut self.cache_file,
                &self.cache_path,
                cache_cursor + ENTRY_OVERHEAD,
                &blob,
            )?;

            let rewritten = IndexRecord {
                hash: candidate.hash,
                size: header.size,
                last_access: record.last_access,
                cache_offset: cache_cursor,
            };
            write_at(
                &mut self.index_file,
                &self.index_path,
                index_cursor,
                &rewritten.encode(),
            )?;

            cache_cursor += ENTRY_OVERHEAD + header.size as u64;
            index_cursor += IndexRecord::SIZE as u64;
        }

        // Orphaned bytes past the last live entry (a crashed writer's
        // half-appended entry) fall off at the truncation that follows.
        Ok((cache_cursor, index_cursor))
    }
}
