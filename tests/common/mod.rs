use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use num_bigint::BigUint;

use transition_core::block::{
    Block, Receipt, ReceiptBuilder, ReceiptList, Status, Transaction, TransactionList, TxId, GENESIS_PREV_ID,
};
use transition_core::codec;
use transition_core::error::{Error, Result};
use transition_core::handler::HandlerKind;
use transition_core::kvstore::{Bucket, Database, BLOCK_BY_ID, BLOCK_HASH_BY_HEIGHT, LAST_HEIGHT};
use transition_core::oracle::RemoteOracle;
use transition_core::transition::TransitionResult;
use transition_core::world::{PublicAddress, ValidatorList, WorldState};

pub const LAST_HEIGHT_KEY: &[u8] = b"block.lastHeight";
pub const TRANSFER_STEP_USED: u32 = 21_000;

pub fn addr(b: u8) -> PublicAddress {
    [b; 32]
}

pub fn transfer(from: u8, to: u8, value: u32, nonce: u64) -> Transaction {
    Transaction {
        id: [from.wrapping_add(to).wrapping_add(nonce as u8); 32],
        kind: HandlerKind::Transfer,
        from: addr(from),
        to: addr(to),
        nonce,
        timestamp: 0,
        value: BigUint::from(value),
        step_limit: BigUint::from(50_000u32),
        step_price: BigUint::from(1u32),
    }
}

/// The receipt a bare `TransferHandler` run produces for a single
/// successful transfer, used as the "authoritative" receipt fixtures
/// compare against.
pub fn expected_transfer_receipt(to: PublicAddress) -> Receipt {
    ReceiptBuilder {
        status: Status::Success,
        to,
        step_used: BigUint::from(TRANSFER_STEP_USED),
        step_price: BigUint::from(1u32),
        contract_address: None,
        logs_bloom: Default::default(),
        fee_payments: vec![],
        event_logs: vec![],
    }
    .freeze(BigUint::from(TRANSFER_STEP_USED))
}

/// Funds `funded` directly in the database and fakes a committed height-0
/// result pointing at that snapshot, standing in for the genesis
/// allocation step this crate does not implement (genesis funding is
/// external configuration, not a replayed transaction).
pub fn seed_genesis(db: &Arc<dyn Database>, funded: PublicAddress, balance: u32) -> TransitionResult {
    let mut world = WorldState::new(None);
    world.account_state(funded).set_balance(BigUint::from(balance));
    let snapshot = world.get_snapshot();
    snapshot.flush(db.as_ref()).expect("flushing genesis snapshot");

    let result = TransitionResult {
        state_hash: snapshot.state_hash(),
        patch_receipt_hash: ReceiptList::empty().root_hash(),
        normal_receipt_hash: ReceiptList::empty().root_hash(),
    };

    let mut genesis_block = Block::new(0, 0, TransactionList::default(), None, None);
    genesis_block.set_result(
        result.state_hash,
        result.patch_receipt_hash,
        result.normal_receipt_hash,
        None,
        BigUint::from(0u32),
    );

    let block_id = genesis_block.id(GENESIS_PREV_ID);
    db.open_bucket(BLOCK_BY_ID)
        .unwrap()
        .set(&block_id, &genesis_block.encode())
        .unwrap();
    db.open_bucket(BLOCK_HASH_BY_HEIGHT)
        .unwrap()
        .set(&codec::height_key(0), &block_id)
        .unwrap();
    db.open_bucket(LAST_HEIGHT)
        .unwrap()
        .set(LAST_HEIGHT_KEY, &codec::height_key(0))
        .unwrap();

    result
}

pub fn read_last_height(db: &Arc<dyn Database>) -> Option<u64> {
    let bucket = db.open_bucket(LAST_HEIGHT).unwrap();
    let bytes = bucket.get(LAST_HEIGHT_KEY).unwrap()?;
    let mut cur = std::io::Cursor::new(bytes.as_slice());
    codec::decode_u64(&mut cur).ok()
}

/// A canned, in-memory [RemoteOracle] fixture. Tracks how many times each
/// height was fetched so tests can assert a cache hit never touched it.
#[derive(Default)]
pub struct TestOracle {
    blocks: HashMap<u64, (Block, ReceiptList)>,
    fetch_counts: Arc<StdMutex<HashMap<u64, usize>>>,
}

impl TestOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, height: u64, block: Block, receipts: ReceiptList) -> Self {
        self.blocks.insert(height, (block, receipts));
        self
    }

    /// A handle to the fetch counters that survives after this oracle is
    /// moved into an [transition_core::executor::Executor].
    pub fn counts(&self) -> Arc<StdMutex<HashMap<u64, usize>>> {
        self.fetch_counts.clone()
    }
}

impl RemoteOracle for TestOracle {
    fn get_block_by_height(&self, height: u64) -> Result<Block> {
        *self.fetch_counts.lock().unwrap().entry(height).or_insert(0) += 1;
        self.blocks
            .get(&height)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| Error::Configuration(format!("no block at height {height}")))
    }

    fn get_receipt_by_transaction(&self, tx_id: TxId) -> Result<Receipt> {
        for (block, receipts) in self.blocks.values() {
            if let Some(index) = block.transactions.iter().position(|tx| tx.id == tx_id) {
                return receipts
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::Configuration(format!("no receipt for transaction {}", hex::encode(tx_id))));
            }
        }
        Err(Error::Configuration(format!("no receipt for transaction {}", hex::encode(tx_id))))
    }

    fn get_reps_by_hash(&self, _hash: [u8; 32]) -> Result<ValidatorList> {
        unimplemented!("not exercised by these tests")
    }
}
