/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Append-only bucketed byte storage.
//!
//! [Database] exposes named [Bucket]s; buckets are flat, unordered,
//! byte-keyed stores. No cross-bucket transactions are required by the core.
//! Two implementations are provided: [RocksDbDatabase] for production use,
//! and [MemoryDatabase] for tests and quick CLI runs that don't need a real
//! on-disk database.

mod memory;
mod rocks;

pub use memory::MemoryDatabase;
pub use rocks::RocksDbDatabase;

use crate::error::Result;

/// Identifies one of the named buckets a [Database] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(pub &'static str);

pub const LAST_HEIGHT: BucketId = BucketId("last-height");
pub const BLOCK_HASH_BY_HEIGHT: BucketId = BucketId("block-hash-by-height");
pub const BLOCK_BY_ID: BucketId = BucketId("block-by-id");
pub const JSON_BY_HASH: BucketId = BucketId("json-by-hash");
/// Owned by [crate::world], not by the executor; listed here anyway so
/// [RocksDbDatabase] provisions its column family up front like every
/// other bucket.
pub const WORLD_STATE: BucketId = BucketId("world-state");

/// All buckets the pipeline ever opens, in the order a fresh [Database]
/// should make them available.
pub const ALL_BUCKETS: &[BucketId] =
    &[LAST_HEIGHT, BLOCK_HASH_BY_HEIGHT, BLOCK_BY_ID, JSON_BY_HASH, WORLD_STATE];

pub trait Database: Send + Sync {
    fn open_bucket(&self, id: BucketId) -> Result<Box<dyn Bucket>>;
}

pub trait Bucket: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
}
