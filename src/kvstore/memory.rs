/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Bucket, Database};
use crate::error::Result;

/// In-process bucketed store. Used by tests and by the CLI in scratch runs
/// that don't need a real on-disk database.
#[derive(Default, Clone)]
pub struct MemoryDatabase {
    buckets: Arc<Mutex<HashMap<&'static str, Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDatabase {
    fn open_bucket(&self, id: super::BucketId) -> Result<Box<dyn Bucket>> {
        let mut buckets = self.buckets.lock();
        let map = buckets.entry(id.0).or_default().clone();
        Ok(Box::new(MemoryBucket { map }))
    }
}

struct MemoryBucket {
    map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Bucket for MemoryBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
