/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks, transaction lists, and receipt lists.
//!
//! A [Block] is materialized from the remote oracle, mutated exactly once
//! when [Block::set_result] attaches the computed outcome, and is immutable
//! thereafter. [TransactionList] and [ReceiptList] are ordered sequences
//! producing a stable root hash over their canonical encoding.

use std::io::Cursor;

use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{Error, Result};
use crate::world::{PublicAddress, StateHash, ValidatorList};

pub type TxId = [u8; 32];

/// A block's own content-addressed identity: `hash(height, timestamp,
/// transaction root, previous block's id)`. Deliberately independent of the
/// *result* of executing the block — two different blocks (at different
/// heights, or with different transactions) can legitimately settle into
/// the same resulting world state (an empty block always does, for
/// instance), and keying `block-by-id`/`block-hash-by-height` on the
/// post-execution state hash would let such blocks silently collide and
/// overwrite each other's persisted entry.
pub type BlockId = [u8; 32];

/// The `prev_id` fed to [Block::id] for height 0, which has no predecessor.
pub const GENESIS_PREV_ID: BlockId = [0u8; 32];

/// The status code carried by a receipt. `Success` and `UnknownFailure`
/// mirror the historical divergence the executor must tolerate
/// (see [crate::executor::check_status]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    UnknownFailure,
    InvalidParameter,
    Failure,
}

impl Status {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Status::Success),
            1 => Ok(Status::UnknownFailure),
            2 => Ok(Status::InvalidParameter),
            3 => Ok(Status::Failure),
            other => Err(Error::Configuration(format!("unknown receipt status tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogBloom(pub [u8; 32]);

impl LogBloom {
    pub fn merge(&mut self, other: &LogBloom) {
        for i in 0..32 {
            self.0[i] |= other.0[i];
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_bytes(out, &self.0);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(LogBloom(decode_address(cur)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePayment {
    pub payer: PublicAddress,
    pub amount: BigUint,
}

impl FeePayment {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_bytes(out, &self.payer);
        codec::encode_bytes(out, &self.amount.to_bytes_be());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(FeePayment {
            payer: decode_address(cur)?,
            amount: BigUint::from_bytes_be(&codec::decode_bytes(cur)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub address: PublicAddress,
    pub indexed: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

impl EventLog {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_bytes(out, &self.address);
        codec::encode_u64(out, self.indexed.len() as u64);
        for topic in &self.indexed {
            codec::encode_bytes(out, topic);
        }
        codec::encode_bytes(out, &self.data);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        let address = decode_address(cur)?;
        let count = codec::decode_u64(cur)?;
        let mut indexed = Vec::with_capacity(count as usize);
        for _ in 0..count {
            indexed.push(codec::decode_bytes(cur)?);
        }
        let data = codec::decode_bytes(cur)?;
        Ok(EventLog { address, indexed, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub kind: crate::handler::HandlerKind,
    pub from: PublicAddress,
    pub to: PublicAddress,
    pub nonce: u64,
    pub timestamp: i64,
    pub value: BigUint,
    pub step_limit: BigUint,
    pub step_price: BigUint,
}

impl Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_bytes(out, &self.id);
        out.push(self.kind.to_u8());
        codec::encode_bytes(out, &self.from);
        codec::encode_bytes(out, &self.to);
        codec::encode_u64(out, self.nonce);
        codec::encode_i64(out, self.timestamp);
        codec::encode_bytes(out, &self.value.to_bytes_be());
        codec::encode_bytes(out, &self.step_limit.to_bytes_be());
        codec::encode_bytes(out, &self.step_price.to_bytes_be());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Transaction {
            id: decode_address(cur)?,
            kind: crate::handler::HandlerKind::from_u8(decode_tag(cur)?)?,
            from: decode_address(cur)?,
            to: decode_address(cur)?,
            nonce: codec::decode_u64(cur)?,
            timestamp: codec::decode_i64(cur)?,
            value: BigUint::from_bytes_be(&codec::decode_bytes(cur)?),
            step_limit: BigUint::from_bytes_be(&codec::decode_bytes(cur)?),
            step_price: BigUint::from_bytes_be(&codec::decode_bytes(cur)?),
        })
    }
}

fn decode_address(cur: &mut Cursor<&[u8]>) -> Result<PublicAddress> {
    codec::decode_bytes(cur)?
        .as_slice()
        .try_into()
        .map_err(|_| Error::Configuration("malformed 32-byte address in encoded block".into()))
}

fn decode_tag(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    use std::io::Read;
    let mut tag = [0u8; 1];
    cur.read_exact(&mut tag)?;
    Ok(tag[0])
}

#[derive(Debug, Clone, Default)]
pub struct TransactionList {
    txs: Vec<Transaction>,
}

impl TransactionList {
    pub fn new(txs: Vec<Transaction>) -> Self {
        Self { txs }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Transaction> {
        self.txs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter()
    }

    pub fn root_hash(&self) -> [u8; 32] {
        merkle_root(self.txs.iter().map(|tx| tx.id.to_vec()))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_u64(out, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(out);
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        let count = codec::decode_u64(cur)?;
        let mut txs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            txs.push(Transaction::decode(cur)?);
        }
        Ok(Self { txs })
    }
}

/// A receipt as published after [crate::transition::Transition] reaches
/// `Complete`: all fields, including `cumulative_steps`, are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub status: Status,
    pub to: PublicAddress,
    pub cumulative_step_used: BigUint,
    pub step_used: BigUint,
    pub step_price: BigUint,
    pub contract_address: Option<PublicAddress>,
    pub logs_bloom: LogBloom,
    pub fee_payments: Vec<FeePayment>,
    pub event_logs: Vec<EventLog>,
}

impl Receipt {
    /// The subset of fields fed into the receipt-list root hash. Deliberately
    /// narrower than [Receipt::persist_encode]: the root hash is an
    /// authoritative-comparison artifact, not a storage format, and doesn't
    /// need the fee-payment/event-log sub-lists to be unambiguous.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.status as u8);
        out.extend_from_slice(&self.to);
        out.extend_from_slice(&self.cumulative_step_used.to_bytes_be());
        out.extend_from_slice(&self.step_used.to_bytes_be());
        out.extend_from_slice(&self.step_price.to_bytes_be());
        out
    }

    /// Full field-for-field encoding used when persisting a block.
    fn persist_encode(&self, out: &mut Vec<u8>) {
        out.push(self.status as u8);
        codec::encode_bytes(out, &self.to);
        codec::encode_bytes(out, &self.cumulative_step_used.to_bytes_be());
        codec::encode_bytes(out, &self.step_used.to_bytes_be());
        codec::encode_bytes(out, &self.step_price.to_bytes_be());
        match &self.contract_address {
            Some(addr) => {
                out.push(1);
                codec::encode_bytes(out, addr);
            }
            None => out.push(0),
        }
        self.logs_bloom.encode(out);
        codec::encode_u64(out, self.fee_payments.len() as u64);
        for fp in &self.fee_payments {
            fp.encode(out);
        }
        codec::encode_u64(out, self.event_logs.len() as u64);
        for log in &self.event_logs {
            log.encode(out);
        }
    }

    fn persist_decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        let status = Status::from_u8(decode_tag(cur)?)?;
        let to = decode_address(cur)?;
        let cumulative_step_used = BigUint::from_bytes_be(&codec::decode_bytes(cur)?);
        let step_used = BigUint::from_bytes_be(&codec::decode_bytes(cur)?);
        let step_price = BigUint::from_bytes_be(&codec::decode_bytes(cur)?);
        let contract_address = match decode_tag(cur)? {
            1 => Some(decode_address(cur)?),
            _ => None,
        };
        let logs_bloom = LogBloom::decode(cur)?;
        let fee_count = codec::decode_u64(cur)?;
        let mut fee_payments = Vec::with_capacity(fee_count as usize);
        for _ in 0..fee_count {
            fee_payments.push(FeePayment::decode(cur)?);
        }
        let log_count = codec::decode_u64(cur)?;
        let mut event_logs = Vec::with_capacity(log_count as usize);
        for _ in 0..log_count {
            event_logs.push(EventLog::decode(cur)?);
        }
        Ok(Receipt {
            status,
            to,
            cumulative_step_used,
            step_used,
            step_price,
            contract_address,
            logs_bloom,
            fee_payments,
            event_logs,
        })
    }
}

/// Mutable receipt under construction during execution. `cumulative_step_used`
/// is not known until the aggregation phase runs over the whole block, so it
/// starts at zero and is set post-hoc by [crate::transition::aggregate].
/// Splitting builder/frozen this way keeps "receipts are mutable during
/// execution, immutable after publication" an enforced type-level fact
/// rather than a convention.
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    pub status: Status,
    pub to: PublicAddress,
    pub step_used: BigUint,
    pub step_price: BigUint,
    pub contract_address: Option<PublicAddress>,
    pub logs_bloom: LogBloom,
    pub fee_payments: Vec<FeePayment>,
    pub event_logs: Vec<EventLog>,
}

impl ReceiptBuilder {
    pub fn freeze(self, cumulative_step_used: BigUint) -> Receipt {
        Receipt {
            status: self.status,
            to: self.to,
            cumulative_step_used,
            step_used: self.step_used,
            step_price: self.step_price,
            contract_address: self.contract_address,
            logs_bloom: self.logs_bloom,
            fee_payments: self.fee_payments,
            event_logs: self.event_logs,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptList {
    receipts: Vec<Receipt>,
}

impl ReceiptList {
    pub fn new(receipts: Vec<Receipt>) -> Self {
        Self { receipts }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Receipt> {
        self.receipts.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Receipt> {
        self.receipts.iter()
    }

    pub fn root_hash(&self) -> [u8; 32] {
        merkle_root(self.receipts.iter().map(|r| r.encode()))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        codec::encode_u64(out, self.receipts.len() as u64);
        for r in &self.receipts {
            r.persist_encode(out);
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        let count = codec::decode_u64(cur)?;
        let mut receipts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            receipts.push(Receipt::persist_decode(cur)?);
        }
        Ok(Self { receipts })
    }
}

fn merkle_root(items: impl Iterator<Item = Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let mut any = false;
    for item in items {
        any = true;
        hasher.update(item);
    }
    if !any {
        // Empty lists produce an empty receipt/transaction-list hash,
        // distinct from any list with at least one element.
        return Sha256::digest(b"empty").into();
    }
    hasher.finalize().into()
}

/// A block materialized from the remote oracle. Mutated exactly once by
/// [Block::set_result]; immutable thereafter.
#[derive(Debug, Clone)]
pub struct Block {
    pub height: u64,
    pub timestamp: i64,
    pub transactions: TransactionList,
    pub old_receipts: Option<ReceiptList>,
    pub validators: Option<ValidatorList>,
    pub next_validators: Option<ValidatorList>,
    pub expected_log_bloom: Option<LogBloom>,

    result: Option<TransitionResultFields>,
    tx_total: BigUint,
}

#[derive(Debug, Clone)]
struct TransitionResultFields {
    state_hash: StateHash,
    patch_receipt_hash: [u8; 32],
    normal_receipt_hash: [u8; 32],
}

impl Block {
    pub fn new(
        height: u64,
        timestamp: i64,
        transactions: TransactionList,
        old_receipts: Option<ReceiptList>,
        validators: Option<ValidatorList>,
    ) -> Self {
        Self {
            height,
            timestamp,
            transactions,
            old_receipts,
            validators,
            next_validators: None,
            expected_log_bloom: None,
            result: None,
            tx_total: BigUint::zero(),
        }
    }

    pub fn tx_total(&self) -> &BigUint {
        &self.tx_total
    }

    /// This block's own content-addressed identity, chained from the
    /// previous block's id. Independent of [Block::set_result]: calling this
    /// before or after a result is attached yields the same id, since a
    /// block's identity must not depend on how its own execution turned out.
    pub fn id(&self, prev_id: BlockId) -> BlockId {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.transactions.root_hash());
        hasher.update(prev_id);
        hasher.finalize().into()
    }

    /// Attaches the authoritative receipts fetched separately from the
    /// block body itself (the oracle exposes them as two calls).
    pub fn set_old_receipts(&mut self, old_receipts: ReceiptList) {
        self.old_receipts = Some(old_receipts);
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// The single mutation point: attaches the computed outcome. Called
    /// exactly once by the executor after `CheckResult` succeeds.
    pub fn set_result(
        &mut self,
        state_hash: StateHash,
        patch_receipt_hash: [u8; 32],
        normal_receipt_hash: [u8; 32],
        next_validators: Option<ValidatorList>,
        tx_total: BigUint,
    ) {
        self.result = Some(TransitionResultFields {
            state_hash,
            patch_receipt_hash,
            normal_receipt_hash,
        });
        self.next_validators = next_validators;
        self.tx_total = tx_total;
    }

    pub fn state_hash(&self) -> Option<StateHash> {
        self.result.as_ref().map(|r| r.state_hash)
    }

    /// The computed outcome as a [crate::transition::TransitionResult], once
    /// [Block::set_result] has attached one.
    pub fn result(&self) -> Option<crate::transition::TransitionResult> {
        self.result.as_ref().map(|r| crate::transition::TransitionResult {
            state_hash: r.state_hash,
            patch_receipt_hash: r.patch_receipt_hash,
            normal_receipt_hash: r.normal_receipt_hash,
        })
    }

    /// The canonical encoding stored under `block-by-id` once the executor
    /// has finalized this block's result.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::encode_u64(&mut out, self.height);
        codec::encode_i64(&mut out, self.timestamp);
        self.transactions.encode(&mut out);

        match &self.old_receipts {
            Some(r) => {
                out.push(1);
                r.encode(&mut out);
            }
            None => out.push(0),
        }
        encode_validator_list(&mut out, &self.validators);
        encode_validator_list(&mut out, &self.next_validators);
        match &self.expected_log_bloom {
            Some(b) => {
                out.push(1);
                b.encode(&mut out);
            }
            None => out.push(0),
        }
        match &self.result {
            Some(r) => {
                out.push(1);
                codec::encode_bytes(&mut out, &r.state_hash);
                codec::encode_bytes(&mut out, &r.patch_receipt_hash);
                codec::encode_bytes(&mut out, &r.normal_receipt_hash);
            }
            None => out.push(0),
        }
        codec::encode_bytes(&mut out, &self.tx_total.to_bytes_be());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let height = codec::decode_u64(&mut cur)?;
        let timestamp = codec::decode_i64(&mut cur)?;
        let transactions = TransactionList::decode(&mut cur)?;

        let old_receipts = match decode_tag(&mut cur)? {
            1 => Some(ReceiptList::decode(&mut cur)?),
            _ => None,
        };
        let validators = decode_validator_list(&mut cur)?;
        let next_validators = decode_validator_list(&mut cur)?;
        let expected_log_bloom = match decode_tag(&mut cur)? {
            1 => Some(LogBloom::decode(&mut cur)?),
            _ => None,
        };
        let result = match decode_tag(&mut cur)? {
            1 => Some(TransitionResultFields {
                state_hash: decode_address(&mut cur)?,
                patch_receipt_hash: decode_address(&mut cur)?,
                normal_receipt_hash: decode_address(&mut cur)?,
            }),
            _ => None,
        };
        let tx_total = BigUint::from_bytes_be(&codec::decode_bytes(&mut cur)?);

        Ok(Block {
            height,
            timestamp,
            transactions,
            old_receipts,
            validators,
            next_validators,
            expected_log_bloom,
            result,
            tx_total,
        })
    }
}

fn encode_validator_list(out: &mut Vec<u8>, validators: &Option<ValidatorList>) {
    match validators {
        Some(vs) => {
            codec::encode_u64(out, vs.len() as u64);
            for v in vs {
                codec::encode_bytes(out, v);
            }
        }
        None => codec::encode_u64(out, u64::MAX),
    }
}

fn decode_validator_list(cur: &mut Cursor<&[u8]>) -> Result<Option<ValidatorList>> {
    let count = codec::decode_u64(cur)?;
    if count == u64::MAX {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(decode_address(cur)?);
    }
    Ok(Some(out))
}
