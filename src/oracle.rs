/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The remote block source and its content-addressed cache.
//!
//! The executor never talks to the network or a database it doesn't own
//! directly — every historical block, authoritative receipt, and validator
//! list comes through [RemoteOracle]. [CachingOracle] wraps any oracle and
//! memoizes validator-list lookups (the one payload the executor fetches
//! repeatedly across heights) in the `json-by-hash` bucket, canonicalized
//! with `serde_json` over a sorted map so the cached bytes are stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::block::{Block, Receipt, TxId};
use crate::error::Result;
use crate::kvstore::{Bucket, Database, JSON_BY_HASH};
use crate::world::{PublicAddress, ValidatorList};

/// A historical data source the executor replays against. Implementations
/// typically wrap a REST client to a full node or an archival service; the
/// wire protocol itself is out of scope for this crate.
///
/// `get_receipt_by_transaction` is keyed by the transaction's own id, one
/// call per transaction — matching the oracle pulling "the expected receipt
/// for every transaction (by tx ID)" rather than one batched call per block.
pub trait RemoteOracle: Send + Sync {
    fn get_block_by_height(&self, height: u64) -> Result<Block>;
    fn get_receipt_by_transaction(&self, tx_id: TxId) -> Result<Receipt>;
    fn get_reps_by_hash(&self, hash: [u8; 32]) -> Result<ValidatorList>;
}

#[derive(Serialize, Deserialize)]
struct ValidatorListJson {
    validators: BTreeMap<String, ()>,
}

fn canonicalize(validators: &ValidatorList) -> Vec<u8> {
    let mut validators_map = BTreeMap::new();
    for v in validators {
        validators_map.insert(hex::encode(v), ());
    }
    let doc = ValidatorListJson {
        validators: validators_map,
    };
    serde_json::to_vec(&doc).expect("validator list json is always serializable")
}

fn decode_validators(bytes: &[u8]) -> Result<ValidatorList> {
    let doc: ValidatorListJson = serde_json::from_slice(bytes)?;
    let mut out = Vec::with_capacity(doc.validators.len());
    for key in doc.validators.keys() {
        let bytes = hex::decode(key).map_err(|e| crate::error::Error::Configuration(e.to_string()))?;
        let addr: PublicAddress = bytes
            .as_slice()
            .try_into()
            .map_err(|_| crate::error::Error::Configuration("malformed validator address".into()))?;
        out.push(addr);
    }
    Ok(out)
}

/// Wraps any [RemoteOracle] with a cache keyed by validator-set hash, the
/// one lookup the executor repeats across consecutive heights whose
/// validator set hasn't changed.
pub struct CachingOracle<O: RemoteOracle> {
    inner: O,
    db: std::sync::Arc<dyn Database>,
}

impl<O: RemoteOracle> CachingOracle<O> {
    pub fn new(inner: O, db: std::sync::Arc<dyn Database>) -> Self {
        Self { inner, db }
    }

    fn bucket(&self) -> Result<Box<dyn Bucket>> {
        self.db.open_bucket(JSON_BY_HASH)
    }
}

impl<O: RemoteOracle> RemoteOracle for CachingOracle<O> {
    fn get_block_by_height(&self, height: u64) -> Result<Block> {
        self.inner.get_block_by_height(height)
    }

    fn get_receipt_by_transaction(&self, tx_id: TxId) -> Result<Receipt> {
        self.inner.get_receipt_by_transaction(tx_id)
    }

    fn get_reps_by_hash(&self, hash: [u8; 32]) -> Result<ValidatorList> {
        let bucket = self.bucket()?;
        if let Some(bytes) = bucket.get(&hash)? {
            tracing::debug!(hash = %hex::encode(hash), "validator list cache hit");
            return decode_validators(&bytes);
        }

        let validators = self.inner.get_reps_by_hash(hash)?;
        bucket.set(&hash, &canonicalize(&validators))?;
        Ok(validators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryDatabase;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle {
        calls: AtomicUsize,
        validators: ValidatorList,
    }

    impl RemoteOracle for CountingOracle {
        fn get_block_by_height(&self, _height: u64) -> Result<Block> {
            unimplemented!()
        }

        fn get_receipt_by_transaction(&self, _tx_id: TxId) -> Result<Receipt> {
            unimplemented!()
        }

        fn get_reps_by_hash(&self, _hash: [u8; 32]) -> Result<ValidatorList> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.validators.clone())
        }
    }

    #[test]
    fn second_lookup_hits_cache() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let inner = CountingOracle {
            calls: AtomicUsize::new(0),
            validators: vec![[7u8; 32]],
        };
        let oracle = CachingOracle::new(inner, db);

        let first = oracle.get_reps_by_hash([1; 32]).unwrap();
        let second = oracle.get_reps_by_hash([1; 32]).unwrap();

        assert_eq!(first, second);
        assert_eq!(oracle.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_hashes_both_miss() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let inner = CountingOracle {
            calls: AtomicUsize::new(0),
            validators: vec![[7u8; 32]],
        };
        let oracle = CachingOracle::new(inner, db);

        oracle.get_reps_by_hash([1; 32]).unwrap();
        oracle.get_reps_by_hash([2; 32]).unwrap();

        assert_eq!(oracle.inner.calls.load(Ordering::SeqCst), 2);
    }
}
