/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use super::{Bucket, Database, ALL_BUCKETS};
use crate::error::Result;

/// Production key-value store: one RocksDB column family per bucket.
pub struct RocksDbDatabase {
    db: Arc<DB>,
}

impl RocksDbDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs: Vec<ColumnFamilyDescriptor> = ALL_BUCKETS
            .iter()
            .map(|b| ColumnFamilyDescriptor::new(b.0, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl Database for RocksDbDatabase {
    fn open_bucket(&self, id: super::BucketId) -> Result<Box<dyn Bucket>> {
        // Column families are all created up-front in `open`, so lookups
        // here never need to create one on demand.
        Ok(Box::new(RocksBucket {
            db: self.db.clone(),
            cf_name: id.0,
        }))
    }
}

struct RocksBucket {
    db: Arc<DB>,
    cf_name: &'static str,
}

impl Bucket for RocksBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(self.cf_name)
            .expect("bucket column family opened at database start");
        Ok(self.db.get_cf(cf, key)?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self
            .db
            .cf_handle(self.cf_name)
            .expect("bucket column family opened at database start");
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::LAST_HEIGHT;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = RocksDbDatabase::open(dir.path()).unwrap();
            let bucket = db.open_bucket(LAST_HEIGHT).unwrap();
            bucket.set(b"k", b"v").unwrap();
        }
        let db = RocksDbDatabase::open(dir.path()).unwrap();
        let bucket = db.open_bucket(LAST_HEIGHT).unwrap();
        assert_eq!(bucket.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
