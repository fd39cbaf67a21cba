//! Shared foundational types for the Cairn blob cache.
//!
//! This crate provides the fixed-width content key used to address cached
//! blobs, the 64-bit lookup hash derived from it, and the blob checksum
//! function used for integrity validation.

#![warn(missing_docs)]

pub mod checksum;
pub mod key;

pub use checksum::blob_checksum;
pub use key::CacheKey;
