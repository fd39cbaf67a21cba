//! A file-backed, content-addressed blob cache engine.
//!
//! Compiled-artifact blobs are keyed by a caller-supplied 160-bit content
//! digest and persisted in a pair of append-mostly files per shard: a
//! cache file holding the blobs and an index file holding fast-lookup
//! records. The [`MultipartDb`] router splits the configured capacity
//! across independently locked [`Part`] shards so unrelated operations
//! never contend on one file lock.
//!
//! The engine is synchronous and safe against concurrent use from other
//! threads and other processes. It is deliberately conservative about
//! damage: any structural or checksum inconsistency wipes the affected
//! shard back to a valid empty state, so corruption surfaces as a cold
//! cache, never as wrong data.

#![warn(missing_docs)]

pub mod codec;
mod compact;
pub mod error;
mod lock;
pub mod multipart;
pub mod part;
mod score;

pub use cairn_common::CacheKey;
pub use error::{DbError, DbResult};
pub use multipart::{DbOptions, MultipartDb, DEFAULT_AGE_DOUBLE_PERIOD, DEFAULT_PART_COUNT};
pub use part::Part;
