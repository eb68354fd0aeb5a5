/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [RemoteOracle] backed by a directory of pre-synced block+receipt JSON
//! files: `<dir>/<height>.json` and an optional `<dir>/validators.json`
//! mapping hex-encoded validator-set hashes to lists of hex-encoded
//! addresses. This is the shape a local legacy-chain store already holds
//! after a sync pass against the real network; it lets the CLI run an
//! end-to-end replay without this crate implementing that network protocol.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use serde::Deserialize;

use transition_core::block::{
    Block, EventLog, FeePayment, LogBloom, Receipt, ReceiptBuilder, Status, Transaction, TransactionList, TxId,
};
use transition_core::error::{Error, Result};
use transition_core::handler::HandlerKind;
use transition_core::oracle::RemoteOracle;
use transition_core::world::{PublicAddress, ValidatorList};

pub struct FileOracle {
    dir: PathBuf,
    validators: BTreeMap<[u8; 32], ValidatorList>,
    receipts_by_tx: BTreeMap<TxId, Receipt>,
}

impl FileOracle {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(Error::Configuration(format!(
                "local chain store directory does not exist: {}",
                dir.display()
            )));
        }

        let validators_path = dir.join("validators.json");
        let validators = if validators_path.exists() {
            let bytes = fs::read(&validators_path)?;
            let doc: BTreeMap<String, Vec<String>> = serde_json::from_slice(&bytes)?;
            doc.into_iter()
                .map(|(hash_hex, addrs)| {
                    let hash = decode_hash(&hash_hex)?;
                    let addrs = addrs.iter().map(|a| decode_address(a)).collect::<Result<Vec<_>>>()?;
                    Ok((hash, addrs))
                })
                .collect::<Result<BTreeMap<_, _>>>()?
        } else {
            BTreeMap::new()
        };

        let mut oracle = Self { dir: dir.to_path_buf(), validators, receipts_by_tx: BTreeMap::new() };
        oracle.receipts_by_tx = oracle.index_receipts_by_tx()?;
        Ok(oracle)
    }

    fn load(&self, height: u64) -> Result<BlockFile> {
        let path = self.dir.join(format!("{height}.json"));
        let bytes = fs::read(&path).map_err(|e| {
            Error::TransientIo(format!("reading block file {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Builds the transaction-id -> receipt index by reading every
    /// `<height>.json` file in the store up front: each file pairs its
    /// `transactions` and `receipts` arrays by position, and the oracle's
    /// public contract is keyed by transaction id, not by height.
    fn index_receipts_by_tx(&self) -> Result<BTreeMap<TxId, Receipt>> {
        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("validators.json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.parse::<u64>().is_err() {
                continue;
            }
            let bytes = fs::read(&path)?;
            let file: BlockFile = serde_json::from_slice(&bytes)?;
            if file.transactions.len() != file.receipts.len() {
                return Err(Error::Configuration(format!(
                    "{}: {} transactions but {} receipts",
                    path.display(),
                    file.transactions.len(),
                    file.receipts.len()
                )));
            }
            for (tx, receipt) in file.transactions.iter().zip(file.receipts.iter()) {
                let id = decode_hash(&tx.id)?;
                index.insert(id, decode_receipt(receipt)?);
            }
        }
        Ok(index)
    }
}

impl RemoteOracle for FileOracle {
    fn get_block_by_height(&self, height: u64) -> Result<Block> {
        let file = self.load(height)?;
        let transactions = file
            .transactions
            .iter()
            .map(decode_transaction)
            .collect::<Result<Vec<_>>>()?;
        let validators = file
            .validators
            .as_ref()
            .map(|vs| vs.iter().map(|a| decode_address(a)).collect::<Result<Vec<_>>>())
            .transpose()?;

        Ok(Block::new(
            height,
            file.timestamp,
            TransactionList::new(transactions),
            None,
            validators,
        ))
    }

    fn get_receipt_by_transaction(&self, tx_id: TxId) -> Result<Receipt> {
        self.receipts_by_tx
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown transaction {}", hex::encode(tx_id))))
    }

    fn get_reps_by_hash(&self, hash: [u8; 32]) -> Result<ValidatorList> {
        self.validators
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown validator set hash {}", hex::encode(hash))))
    }
}

#[derive(Deserialize)]
struct BlockFile {
    timestamp: i64,
    #[serde(default)]
    validators: Option<Vec<String>>,
    transactions: Vec<TransactionJson>,
    #[serde(default)]
    receipts: Vec<ReceiptJson>,
}

#[derive(Deserialize)]
struct TransactionJson {
    id: String,
    kind: String,
    from: String,
    to: String,
    nonce: u64,
    timestamp: i64,
    value: String,
    step_limit: String,
    step_price: String,
}

#[derive(Deserialize)]
struct ReceiptJson {
    status: String,
    to: String,
    cumulative_step_used: String,
    step_used: String,
    step_price: String,
    #[serde(default)]
    contract_address: Option<String>,
    #[serde(default)]
    logs_bloom: Option<String>,
    #[serde(default)]
    fee_payments: Vec<FeePaymentJson>,
    #[serde(default)]
    event_logs: Vec<EventLogJson>,
}

#[derive(Deserialize)]
struct FeePaymentJson {
    payer: String,
    amount: String,
}

#[derive(Deserialize)]
struct EventLogJson {
    address: String,
    #[serde(default)]
    indexed: Vec<String>,
    data: String,
}

fn decode_transaction(tx: &TransactionJson) -> Result<Transaction> {
    Ok(Transaction {
        id: decode_hash(&tx.id)?,
        kind: decode_kind(&tx.kind)?,
        from: decode_address(&tx.from)?,
        to: decode_address(&tx.to)?,
        nonce: tx.nonce,
        timestamp: tx.timestamp,
        value: decode_biguint(&tx.value)?,
        step_limit: decode_biguint(&tx.step_limit)?,
        step_price: decode_biguint(&tx.step_price)?,
    })
}

fn decode_receipt(r: &ReceiptJson) -> Result<Receipt> {
    let cumulative_step_used = decode_biguint(&r.cumulative_step_used)?;
    let builder = ReceiptBuilder {
        status: decode_status(&r.status)?,
        to: decode_address(&r.to)?,
        step_used: decode_biguint(&r.step_used)?,
        step_price: decode_biguint(&r.step_price)?,
        contract_address: r.contract_address.as_deref().map(decode_address).transpose()?,
        logs_bloom: r.logs_bloom.as_deref().map(decode_log_bloom).transpose()?.unwrap_or_default(),
        fee_payments: r.fee_payments.iter().map(decode_fee_payment).collect::<Result<Vec<_>>>()?,
        event_logs: r.event_logs.iter().map(decode_event_log).collect::<Result<Vec<_>>>()?,
    };
    Ok(builder.freeze(cumulative_step_used))
}

fn decode_fee_payment(f: &FeePaymentJson) -> Result<FeePayment> {
    Ok(FeePayment {
        payer: decode_address(&f.payer)?,
        amount: decode_biguint(&f.amount)?,
    })
}

fn decode_event_log(e: &EventLogJson) -> Result<EventLog> {
    Ok(EventLog {
        address: decode_address(&e.address)?,
        indexed: e.indexed.iter().map(|s| hex::decode(s)).collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::Configuration(err.to_string()))?,
        data: hex::decode(&e.data).map_err(|err| Error::Configuration(err.to_string()))?,
    })
}

fn decode_kind(kind: &str) -> Result<HandlerKind> {
    match kind {
        "transfer" => Ok(HandlerKind::Transfer),
        other => Err(Error::Configuration(format!("unknown transaction kind: {other}"))),
    }
}

fn decode_status(status: &str) -> Result<Status> {
    match status {
        "success" => Ok(Status::Success),
        "unknown_failure" => Ok(Status::UnknownFailure),
        "invalid_parameter" => Ok(Status::InvalidParameter),
        "failure" => Ok(Status::Failure),
        other => Err(Error::Configuration(format!("unknown receipt status: {other}"))),
    }
}

fn decode_biguint(s: &str) -> Result<BigUint> {
    s.parse::<BigUint>()
        .map_err(|e| Error::Configuration(format!("malformed integer {s:?}: {e}")))
}

fn decode_address(s: &str) -> Result<PublicAddress> {
    let bytes = hex::decode(s).map_err(|e| Error::Configuration(format!("malformed address {s:?}: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Configuration(format!("address {s:?} is not 32 bytes")))
}

fn decode_hash(s: &str) -> Result<[u8; 32]> {
    decode_address(s)
}

fn decode_log_bloom(s: &str) -> Result<LogBloom> {
    Ok(LogBloom(decode_hash(s)?))
}
