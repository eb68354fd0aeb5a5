/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transaction-handler capability.
//!
//! The transaction-handler VM / smart-contract engine is explicitly out of
//! scope for this crate — it is consumed as an opaque `Execute(context) ->
//! receipt` capability. Rather than dispatch on runtime type reflection,
//! handlers are selected from a finite, enumerated [HandlerKind] tag
//! carried by the transaction itself — a capability trait with a small
//! `match`, not a vtable keyed by type id.

use num_bigint::BigUint;

use crate::block::{LogBloom, ReceiptBuilder, Status, Transaction, TxId};
use crate::error::{Error, Result};
use crate::world::{PublicAddress, WorldState};

/// Tag carried by a transaction identifying which handler executes it.
/// New transaction types are added here, not by introspecting a handler's
/// runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Transfer,
}

impl HandlerKind {
    pub fn to_u8(self) -> u8 {
        match self {
            HandlerKind::Transfer => 0,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(HandlerKind::Transfer),
            other => Err(Error::Configuration(format!("unknown handler kind tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub height: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionInfo {
    pub index: usize,
    pub timestamp: i64,
    pub nonce: u64,
    pub hash: TxId,
    pub from: PublicAddress,
}

/// Marker standing in for the real contract-manager / execution-engine-manager
/// references the context bundles. The protocol this wires to (`<data>/ee.sock`)
/// is out of scope; the interface is kept so a real VM crate can be plugged
/// in without reshaping the handler contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContractManager;
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionEngineManager;

/// Bundles everything a handler needs: the mutable world state, block info,
/// and this transaction's own metadata.
pub struct HandlerContext<'a> {
    pub world: &'a mut WorldState,
    pub block: BlockInfo,
    pub txn: TransactionInfo,
    pub contract_manager: ContractManager,
    pub engine_manager: ExecutionEngineManager,
}

/// The capability a transaction handler offers: given a context, produce a
/// receipt and mutate the world. On error the handler is either returning a
/// receipt with failure status, or the caller must treat the call as
/// catastrophic (fatal — see [Error::HandlerInvariant]).
pub trait TransactionHandler {
    fn execute(&self, ctx: &mut HandlerContext, tx: &Transaction) -> Result<ReceiptBuilder>;
}

/// Resolves the handler for a transaction from its own tag — never from
/// runtime type introspection.
pub fn get_handler(kind: HandlerKind) -> Box<dyn TransactionHandler> {
    match kind {
        HandlerKind::Transfer => Box::new(TransferHandler),
    }
}

/// The one concrete handler this crate ships: a plain balance transfer,
/// charging `step_used * step_price` to the sender alongside the transfer
/// value. Stands in for the real transaction-handler VM, which is a
/// separately-deployed process reached over the handler contract above.
pub struct TransferHandler;

const TRANSFER_STEP_USED: u32 = 21_000;

impl TransactionHandler for TransferHandler {
    fn execute(&self, ctx: &mut HandlerContext, tx: &Transaction) -> Result<ReceiptBuilder> {
        let step_used = BigUint::from(TRANSFER_STEP_USED);
        if step_used > tx.step_limit {
            return Err(Error::HandlerInvariant(format!(
                "transfer step usage {step_used} exceeds step limit {}",
                tx.step_limit
            )));
        }

        let fee = &step_used * &tx.step_price;
        let total_debit = &tx.value + &fee;

        let sender_balance = ctx.world.account_state(tx.from).get_balance();
        if sender_balance < total_debit {
            return Ok(ReceiptBuilder {
                status: Status::Failure,
                to: tx.to,
                step_used,
                step_price: tx.step_price.clone(),
                contract_address: None,
                logs_bloom: LogBloom::default(),
                fee_payments: vec![],
                event_logs: vec![],
            });
        }

        ctx.world
            .account_state(tx.from)
            .set_balance(sender_balance - &total_debit);
        let recipient_balance = ctx.world.account_state(tx.to).get_balance();
        ctx.world
            .account_state(tx.to)
            .set_balance(recipient_balance + &tx.value);
        let sender_nonce = ctx.world.account_state(tx.from).get_nonce();
        ctx.world.account_state(tx.from).set_nonce(sender_nonce + 1);

        Ok(ReceiptBuilder {
            status: Status::Success,
            to: tx.to,
            step_used,
            step_price: tx.step_price.clone(),
            contract_address: None,
            logs_bloom: LogBloom::default(),
            fee_payments: vec![],
            event_logs: vec![],
        })
    }
}

/// `PreValidate`: the nonce and gas-affordability checks that run against a
/// read-only context before any transaction in the block is executed. The
/// first failure here stops the whole block (see [crate::transition]).
pub fn pre_validate(account_nonce: u64, account_balance: &BigUint, tx: &Transaction) -> std::result::Result<(), String> {
    if tx.nonce != account_nonce {
        return Err(format!(
            "wrong nonce: tx has {}, account is at {}",
            tx.nonce, account_nonce
        ));
    }
    let max_cost = &tx.value + &tx.step_limit * &tx.step_price;
    if *account_balance < max_cost {
        return Err(format!(
            "insufficient balance: have {account_balance}, need up to {max_cost}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod receipt_tests {
    use super::*;

    fn addr(b: u8) -> PublicAddress {
        [b; 32]
    }

    #[test]
    fn transfer_moves_balance_and_charges_fee() {
        let mut world = WorldState::new(None);
        world.account_state(addr(1)).set_balance(BigUint::from(100_000u32));

        let tx = Transaction {
            id: [0; 32],
            kind: HandlerKind::Transfer,
            from: addr(1),
            to: addr(2),
            nonce: 0,
            timestamp: 0,
            value: BigUint::from(10u32),
            step_limit: BigUint::from(50_000u32),
            step_price: BigUint::from(1u32),
        };

        let mut ctx = HandlerContext {
            world: &mut world,
            block: BlockInfo { height: 1, timestamp: 0 },
            txn: TransactionInfo {
                index: 0,
                timestamp: 0,
                nonce: 0,
                hash: tx.id,
                from: tx.from,
            },
            contract_manager: ContractManager,
            engine_manager: ExecutionEngineManager,
        };

        let receipt = get_handler(HandlerKind::Transfer)
            .execute(&mut ctx, &tx)
            .unwrap()
            .freeze(BigUint::from(21_000u32));

        assert_eq!(receipt.status, Status::Success);
        assert_eq!(world.account_state(addr(2)).get_balance(), BigUint::from(10u32));
        assert_eq!(
            world.account_state(addr(1)).get_balance(),
            BigUint::from(100_000u32 - 10 - 21_000)
        );
    }

    #[test]
    fn insufficient_balance_yields_failure_status_not_error() {
        let mut world = WorldState::new(None);
        let tx = Transaction {
            id: [0; 32],
            kind: HandlerKind::Transfer,
            from: addr(1),
            to: addr(2),
            nonce: 0,
            timestamp: 0,
            value: BigUint::from(10u32),
            step_limit: BigUint::from(50_000u32),
            step_price: BigUint::from(1u32),
        };
        let mut ctx = HandlerContext {
            world: &mut world,
            block: BlockInfo { height: 1, timestamp: 0 },
            txn: TransactionInfo {
                index: 0,
                timestamp: 0,
                nonce: 0,
                hash: tx.id,
                from: tx.from,
            },
            contract_manager: ContractManager,
            engine_manager: ExecutionEngineManager,
        };
        let receipt = get_handler(HandlerKind::Transfer).execute(&mut ctx, &tx).unwrap();
        assert_eq!(receipt.status, Status::Failure);
    }
}
