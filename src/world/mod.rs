/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable in-memory account/validator tree and its immutable snapshots.
//!
//! [WorldState] buffers account mutations in memory; [WorldState::get_snapshot]
//! produces an immutable [WorldSnapshot] identified by a content hash. Any
//! snapshot can seed a fresh [WorldState] (`WorldState::from_snapshot`), which
//! is how a [Transition](crate::transition::Transition) derives a child
//! context from its parent without retaining the parent's mutable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::BigUint;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::Result;
use crate::kvstore::{Bucket, Database};

pub type PublicAddress = [u8; 32];
pub type StateHash = [u8; 32];

pub type ValidatorList = Vec<PublicAddress>;

/// The designated treasury account transaction fees are credited to.
/// Deliberately not the zero address: ordinary accounts are free to use any
/// 32-byte value, including all-zero, so the treasury needs its own
/// non-degenerate identity to avoid colliding with one. The specific value
/// mirrors the `treasury_address: [100u8; 32]` fixture `pchain-runtime`'s own
/// test suite seeds its `BlockchainData` with.
pub const TREASURY_ADDRESS: PublicAddress = [100u8; 32];

use crate::kvstore::WORLD_STATE as WORLD_STATE_BUCKET;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: BigUint,
    pub nonce: u64,
    pub contract_code: Option<Vec<u8>>,
}

/// Mutable view over accounts and validators, rooted at an optional parent
/// state hash. Mutations are buffered in memory until [WorldState::get_snapshot]
/// is called; snapshotting is idempotent and deterministic given identical
/// mutation sequences, because accounts are kept in a [BTreeMap] and hashed
/// in key order.
pub struct WorldState {
    accounts: BTreeMap<PublicAddress, Account>,
    validators: Option<ValidatorList>,
    next_validators: Option<ValidatorList>,
}

impl WorldState {
    /// Builds the empty world, with no accounts, used for height 0's
    /// ancestor transition. Any non-empty ancestor is rooted via
    /// [WorldState::from_snapshot] instead.
    pub fn new(validators: Option<ValidatorList>) -> Self {
        Self {
            accounts: BTreeMap::new(),
            validators,
            next_validators: None,
        }
    }

    /// Clones a parent snapshot into a fresh mutable state, the way a
    /// transition derives its execution context from the previous one.
    pub fn from_snapshot(snapshot: &WorldSnapshot) -> Self {
        Self {
            accounts: snapshot.accounts.clone(),
            validators: snapshot.validators.clone(),
            next_validators: None,
        }
    }

    pub fn account_state(&mut self, id: PublicAddress) -> AccountState<'_> {
        AccountState {
            account: self.accounts.entry(id).or_default(),
        }
    }

    pub fn validators(&self) -> Option<&ValidatorList> {
        self.validators.as_ref()
    }

    pub fn set_next_validators(&mut self, validators: ValidatorList) {
        self.next_validators = Some(validators);
    }

    /// Computes the content hash of the current set of accounts and
    /// validators and freezes it into an immutable snapshot.
    pub fn get_snapshot(&self) -> WorldSnapshot {
        let state_hash = hash_accounts(&self.accounts, self.validators.as_deref());
        WorldSnapshot {
            accounts: self.accounts.clone(),
            validators: self.validators.clone(),
            next_validators: self.next_validators.clone(),
            state_hash,
        }
    }
}

pub struct AccountState<'a> {
    account: &'a mut Account,
}

impl<'a> AccountState<'a> {
    pub fn get_balance(&self) -> BigUint {
        self.account.balance.clone()
    }

    pub fn set_balance(&mut self, balance: BigUint) {
        self.account.balance = balance;
    }

    pub fn get_nonce(&self) -> u64 {
        self.account.nonce
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.account.nonce = nonce;
    }
}

/// Immutable view of all accounts and validators at a point in time,
/// identified by [WorldSnapshot::state_hash]. Snapshots form a DAG by parent
/// reference in the sense that any snapshot can seed a new [WorldState], but
/// the snapshot itself holds no pointer back to its parent — the parent link
/// lives on the owning [Transition](crate::transition::Transition) and is
/// severed on finalize.
#[derive(Clone)]
pub struct WorldSnapshot {
    accounts: BTreeMap<PublicAddress, Account>,
    validators: Option<ValidatorList>,
    next_validators: Option<ValidatorList>,
    state_hash: StateHash,
}

impl WorldSnapshot {
    pub fn empty() -> Self {
        WorldState::new(None).get_snapshot()
    }

    pub fn state_hash(&self) -> StateHash {
        self.state_hash
    }

    pub fn validator_snapshot(&self) -> Option<ValidatorList> {
        self.next_validators.clone().or_else(|| self.validators.clone())
    }

    pub fn account(&self, id: &PublicAddress) -> Account {
        self.accounts.get(id).cloned().unwrap_or_default()
    }

    /// Persists all reachable nodes into the store, keyed by this snapshot's
    /// own state hash. Idempotent: flushing the same snapshot twice is a
    /// no-op past the first write. This is an internal bucket owned by the
    /// World State component (C2), distinct from the four buckets the
    /// executor itself persists into.
    pub fn flush(&self, db: &dyn Database) -> Result<()> {
        let bucket: Box<dyn Bucket> = db.open_bucket(WORLD_STATE_BUCKET)?;
        bucket.set(&self.state_hash, &self.encode())
    }

    /// Reloads a previously flushed snapshot by its content hash. Used by
    /// `Transition::new_init` to seed a world state from a prior block's
    /// committed result.
    pub fn load(db: &dyn Database, state_hash: StateHash) -> Result<Self> {
        let bucket: Box<dyn Bucket> = db.open_bucket(WORLD_STATE_BUCKET)?;
        match bucket.get(&state_hash)? {
            Some(bytes) => Self::decode(&bytes, state_hash),
            None => Ok(Self::empty()),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::encode_u64(&mut out, self.accounts.len() as u64);
        for (id, account) in &self.accounts {
            codec::encode_bytes(&mut out, id);
            codec::encode_bytes(&mut out, &account.balance.to_bytes_be());
            codec::encode_u64(&mut out, account.nonce);
        }
        let validators = self.validators.clone().unwrap_or_default();
        codec::encode_u64(&mut out, validators.len() as u64);
        for v in &validators {
            codec::encode_bytes(&mut out, v);
        }
        out
    }

    fn decode(bytes: &[u8], state_hash: StateHash) -> Result<Self> {
        use std::io::Cursor;
        let mut cur = Cursor::new(bytes);
        let count = codec::decode_u64(&mut cur)?;
        let mut accounts = BTreeMap::new();
        for _ in 0..count {
            let id_bytes = codec::decode_bytes(&mut cur)?;
            let id: PublicAddress = id_bytes
                .as_slice()
                .try_into()
                .map_err(|_| crate::error::Error::Configuration("malformed account id".into()))?;
            let balance = BigUint::from_bytes_be(&codec::decode_bytes(&mut cur)?);
            let nonce = codec::decode_u64(&mut cur)?;
            accounts.insert(id, Account { balance, nonce, contract_code: None });
        }
        let validator_count = codec::decode_u64(&mut cur)?;
        let mut validators = Vec::new();
        for _ in 0..validator_count {
            let v_bytes = codec::decode_bytes(&mut cur)?;
            let v: PublicAddress = v_bytes
                .as_slice()
                .try_into()
                .map_err(|_| crate::error::Error::Configuration("malformed validator id".into()))?;
            validators.push(v);
        }
        let validators = if validators.is_empty() { None } else { Some(validators) };
        Ok(Self {
            accounts,
            validators,
            next_validators: None,
            state_hash,
        })
    }
}

fn hash_accounts(accounts: &BTreeMap<PublicAddress, Account>, validators: Option<&[PublicAddress]>) -> StateHash {
    let mut hasher = Sha256::new();
    for (id, account) in accounts {
        hasher.update(id);
        hasher.update(account.balance.to_bytes_be());
        hasher.update(account.nonce.to_be_bytes());
    }
    if let Some(validators) = validators {
        for v in validators {
            hasher.update(v);
        }
    }
    hasher.finalize().into()
}

/// Marker used when a snapshot needs to be shared between the owning
/// transition and its children without cloning the full account map.
pub type SharedSnapshot = Arc<WorldSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> PublicAddress {
        [b; 32]
    }

    #[test]
    fn empty_world_has_stable_hash() {
        let a = WorldSnapshot::empty();
        let b = WorldSnapshot::empty();
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn snapshot_is_deterministic_given_same_mutations() {
        let mut ws1 = WorldState::new(None);
        ws1.account_state(addr(1)).set_balance(BigUint::from(10u32));
        ws1.account_state(addr(2)).set_balance(BigUint::from(20u32));

        let mut ws2 = WorldState::new(None);
        ws2.account_state(addr(2)).set_balance(BigUint::from(20u32));
        ws2.account_state(addr(1)).set_balance(BigUint::from(10u32));

        assert_eq!(ws1.get_snapshot().state_hash(), ws2.get_snapshot().state_hash());
    }

    #[test]
    fn mutation_changes_hash() {
        let mut ws = WorldState::new(None);
        let empty_hash = ws.get_snapshot().state_hash();
        ws.account_state(addr(1)).set_balance(BigUint::from(1u32));
        assert_ne!(ws.get_snapshot().state_hash(), empty_hash);
    }

    #[test]
    fn child_state_inherits_parent_accounts() {
        let mut parent = WorldState::new(None);
        parent.account_state(addr(9)).set_balance(BigUint::from(99u32));
        let snapshot = parent.get_snapshot();

        let mut child = WorldState::from_snapshot(&snapshot);
        assert_eq!(child.account_state(addr(9)).get_balance(), BigUint::from(99u32));
    }

    #[test]
    fn flush_then_load_round_trips() {
        use crate::kvstore::MemoryDatabase;

        let mut ws = WorldState::new(None);
        ws.account_state(addr(3)).set_balance(BigUint::from(777u32));
        ws.set_next_validators(vec![addr(5)]);
        let snapshot = ws.get_snapshot();

        let db = MemoryDatabase::new();
        snapshot.flush(&db).unwrap();

        let reloaded = WorldSnapshot::load(&db, snapshot.state_hash()).unwrap();
        assert_eq!(reloaded.account(&addr(3)).balance, BigUint::from(777u32));
        assert_eq!(reloaded.state_hash(), snapshot.state_hash());
    }
}
