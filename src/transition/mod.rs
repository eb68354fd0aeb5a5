/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transition state machine (C4).
//!
//! A [Transition] represents the progress of one block's execution: parent
//! snapshot → validated → executed → complete/error/canceled. It owns its
//! in-progress receipt buffers exclusively until `Complete`, at which point
//! they become shared-immutable. Execution runs on a single spawned worker
//! thread; the caller is notified of `OnValidate` then `OnExecute`, in that
//! order, through a two-slot buffered channel — never more than once each,
//! and never out of order.

pub mod result;

pub use result::TransitionResult;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::Zero;
use parking_lot::Mutex;

use crate::block::{LogBloom, ReceiptList, TransactionList};
use crate::error::{Error, Result};
use crate::handler::{self, BlockInfo, ContractManager, ExecutionEngineManager, HandlerContext, TransactionInfo};
use crate::kvstore::Database;
use crate::world::{WorldSnapshot, WorldState};

/// Consensus metadata threaded through every new transition. A block-replay
/// executor needs none of it; kept as an empty marker so the constructor
/// shape still matches a future consensus-aware caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsensusInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Inited,
    Validating,
    Validated,
    Executing,
    Complete,
    Error,
    Canceled,
}

impl Step {
    fn is_terminal(self) -> bool {
        matches!(self, Step::Complete | Step::Error)
    }
}

/// Two sequential notifications, delivered in order. Implementations must
/// not block for long — the executor's outer loop is typically waiting on
/// the other end of the channel that drives this.
pub trait TransitionCallback: Send + Sync {
    fn on_validate(&self, result: std::result::Result<(), Error>);
    fn on_execute(&self, result: std::result::Result<(), Error>);
}

/// Adapts the two-callback interface onto a two-slot buffered channel: the
/// second event cannot be observed ahead of the first without additional
/// synchronization, because the channel itself is FIFO and ordered.
pub struct ChannelCallback {
    tx: SyncSender<std::result::Result<(), Error>>,
}

impl ChannelCallback {
    pub fn new_pair() -> (Self, Receiver<std::result::Result<(), Error>>) {
        let (tx, rx) = sync_channel(2);
        (Self { tx }, rx)
    }
}

impl TransitionCallback for ChannelCallback {
    fn on_validate(&self, result: std::result::Result<(), Error>) {
        let _ = self.tx.send(result);
    }

    fn on_execute(&self, result: std::result::Result<(), Error>) {
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct Outcome {
    result: Option<TransitionResult>,
    world_snapshot: Option<WorldSnapshot>,
    patch_receipts: Option<ReceiptList>,
    normal_receipts: Option<ReceiptList>,
    log_bloom: Option<LogBloom>,
}

pub type CancelFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// The state machine driving one block's execution. See module docs and
/// the module docs above for the full contract.
pub struct Transition {
    parent: Mutex<Option<Arc<Transition>>>,
    db: Arc<dyn Database>,
    block_info: BlockInfo,
    patch_transactions: TransactionList,
    normal_transactions: TransactionList,
    step: Arc<Mutex<Step>>,
    started: AtomicBool,
    outcome: Mutex<Outcome>,
}

impl Transition {
    /// Yields an already-`Complete` transition seeded from a previously
    /// serialized result, or the empty world if there is none. This is the
    /// ancestor every replay run is rooted at.
    pub fn new_init(
        db: Arc<dyn Database>,
        prev_result: Option<&[u8]>,
        validators: Option<crate::world::ValidatorList>,
    ) -> Result<Arc<Transition>> {
        let prev_result = prev_result.filter(|b| !b.is_empty());

        let parsed = prev_result.map(TransitionResult::from_bytes).transpose()?;
        let snapshot = match parsed {
            Some(tr) => WorldSnapshot::load(db.as_ref(), tr.state_hash)?,
            None => WorldState::new(validators).get_snapshot(),
        };

        Ok(Arc::new(Transition {
            parent: Mutex::new(None),
            db,
            block_info: BlockInfo { height: 0, timestamp: 0 },
            patch_transactions: TransactionList::default(),
            normal_transactions: TransactionList::default(),
            step: Arc::new(Mutex::new(Step::Complete)),
            started: AtomicBool::new(true),
            outcome: Mutex::new(Outcome {
                result: parsed,
                world_snapshot: Some(snapshot),
                patch_receipts: Some(ReceiptList::empty()),
                normal_receipts: Some(ReceiptList::empty()),
                log_bloom: Some(LogBloom::default()),
            }),
        }))
    }

    /// Yields a fresh `Inited` (or `Validated`, if `already_validated`)
    /// transition chained to `parent`.
    pub fn new(
        parent: Arc<Transition>,
        patch_transactions: TransactionList,
        normal_transactions: TransactionList,
        block_info: BlockInfo,
        already_validated: bool,
        _consensus_info: ConsensusInfo,
    ) -> Arc<Transition> {
        let db = parent.db.clone();
        let step = if already_validated { Step::Validated } else { Step::Inited };
        Arc::new(Transition {
            parent: Mutex::new(Some(parent)),
            db,
            block_info,
            patch_transactions,
            normal_transactions,
            step: Arc::new(Mutex::new(step)),
            started: AtomicBool::new(false),
            outcome: Mutex::new(Outcome::default()),
        })
    }

    pub fn patch_transactions(&self) -> &TransactionList {
        &self.patch_transactions
    }

    pub fn normal_transactions(&self) -> &TransactionList {
        &self.normal_transactions
    }

    pub fn step(&self) -> Step {
        *self.step.lock()
    }

    /// Starts asynchronous processing. Returns immediately with a cancel
    /// closure. Rejected with `InvalidState` if the current step is not
    /// `Inited` or `Validated`; a transition is executed at most once.
    pub fn execute(self: &Arc<Self>, cb: Box<dyn TransitionCallback>) -> Result<CancelFn> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::InvalidState(
                "transition already executed: a transition is executed at most once".into(),
            ));
        }

        let already_validated_entry = {
            let mut step = self.step.lock();
            match *step {
                Step::Inited => {
                    *step = Step::Validating;
                    false
                }
                Step::Validated => {
                    *step = Step::Executing;
                    true
                }
                // Canceled before the worker ever started: let the worker
                // thread observe the cancellation and exit quietly, same as
                // a mid-run cancel, instead of rejecting the call outright.
                Step::Canceled => false,
                other => {
                    self.started.store(false, Ordering::SeqCst);
                    return Err(Error::InvalidState(format!("cannot execute from {other:?}")));
                }
            }
        };

        let this = self.clone();
        std::thread::spawn(move || this.run_worker(already_validated_entry, cb));

        let step_handle = self.step.clone();
        Ok(Arc::new(move || cancel_step(&step_handle)))
    }

    fn run_worker(self: Arc<Self>, already_validated: bool, cb: Box<dyn TransitionCallback>) {
        if !already_validated {
            match self.validate_phase() {
                Ok(()) => {
                    cb.on_validate(Ok(()));
                    self.set_step(Step::Executing);
                }
                // A cancellation observed during validation is not a
                // validation failure; stay quiet, same as a cancellation
                // observed during execution.
                Err(Error::Cancellation) => return,
                Err(e) => {
                    self.set_step(Step::Error);
                    cb.on_validate(Err(e));
                    return;
                }
            }
        } else {
            cb.on_validate(Ok(()));
        }

        match self.execute_phase() {
            Ok(()) => {
                self.set_step(Step::Complete);
                cb.on_execute(Ok(()));
            }
            Err(Error::Cancellation) => {
                // Worker exits quietly; OnExecute never fires for a
                // canceled transition.
            }
            Err(e) => {
                self.set_step(Step::Error);
                cb.on_execute(Err(e));
            }
        }
    }

    fn set_step(&self, step: Step) {
        *self.step.lock() = step;
    }

    fn parent_snapshot(&self) -> WorldSnapshot {
        match self.parent.lock().as_ref() {
            Some(parent) => parent
                .outcome
                .lock()
                .world_snapshot
                .clone()
                .expect("parent transition must have a snapshot before children execute"),
            None => WorldSnapshot::empty(),
        }
    }

    fn check_canceled(&self) -> Result<()> {
        if self.step() == Step::Canceled {
            Err(Error::Cancellation)
        } else {
            Ok(())
        }
    }

    fn validate_phase(&self) -> Result<()> {
        self.check_canceled()?;
        let snapshot = self.parent_snapshot();

        for tx in self.patch_transactions.iter().chain(self.normal_transactions.iter()) {
            self.check_canceled()?;
            let account = snapshot.account(&tx.from);
            handler::pre_validate(account.nonce, &account.balance, tx).map_err(Error::Validation)?;
        }
        Ok(())
    }

    fn execute_phase(&self) -> Result<()> {
        self.check_canceled()?;
        let snapshot = self.parent_snapshot();
        let mut world = WorldState::from_snapshot(&snapshot);

        let mut patch_receipts = Vec::with_capacity(self.patch_transactions.len());
        let mut normal_receipts = Vec::with_capacity(self.normal_transactions.len());

        self.execute_list(&self.patch_transactions, &mut world, &mut patch_receipts)?;
        self.execute_list(&self.normal_transactions, &mut world, &mut normal_receipts)?;

        let mut cumulative_steps = BigUint::zero();
        let mut gathered_fee = BigUint::zero();
        let mut log_bloom = LogBloom::default();

        let mut patch_frozen = Vec::with_capacity(patch_receipts.len());
        let mut normal_frozen = Vec::with_capacity(normal_receipts.len());

        for (builder, step_used) in patch_receipts {
            cumulative_steps += &step_used;
            gathered_fee += &step_used * &builder.step_price;
            log_bloom.merge(&builder.logs_bloom);
            patch_frozen.push(builder.freeze(cumulative_steps.clone()));
        }
        for (builder, step_used) in normal_receipts {
            cumulative_steps += &step_used;
            gathered_fee += &step_used * &builder.step_price;
            log_bloom.merge(&builder.logs_bloom);
            normal_frozen.push(builder.freeze(cumulative_steps.clone()));
        }

        let treasury = crate::world::TREASURY_ADDRESS;
        let treasury_balance = world.account_state(treasury).get_balance();
        world.account_state(treasury).set_balance(treasury_balance + &gathered_fee);

        let world_snapshot = world.get_snapshot();
        let patch_list = ReceiptList::new(patch_frozen);
        let normal_list = ReceiptList::new(normal_frozen);

        let result = TransitionResult {
            state_hash: world_snapshot.state_hash(),
            patch_receipt_hash: patch_list.root_hash(),
            normal_receipt_hash: normal_list.root_hash(),
        };

        let mut outcome = self.outcome.lock();
        outcome.world_snapshot = Some(world_snapshot);
        outcome.patch_receipts = Some(patch_list);
        outcome.normal_receipts = Some(normal_list);
        outcome.log_bloom = Some(log_bloom);
        outcome.result = Some(result);
        Ok(())
    }

    fn execute_list(
        &self,
        txs: &TransactionList,
        world: &mut WorldState,
        out: &mut Vec<(crate::block::ReceiptBuilder, BigUint)>,
    ) -> Result<()> {
        for (index, tx) in txs.iter().enumerate() {
            self.check_canceled()?;
            let handler = handler::get_handler(tx.kind);
            let mut ctx = HandlerContext {
                world,
                block: self.block_info,
                txn: TransactionInfo {
                    index,
                    timestamp: tx.timestamp,
                    nonce: tx.nonce,
                    hash: tx.id,
                    from: tx.from,
                },
                contract_manager: ContractManager,
                engine_manager: ExecutionEngineManager,
            };
            let builder = handler.execute(&mut ctx, tx)?;
            let step_used = builder.step_used.clone();
            out.push((builder, step_used));
        }
        Ok(())
    }

    pub fn result(&self) -> Option<TransitionResult> {
        if self.step() != Step::Complete {
            return None;
        }
        self.outcome.lock().result
    }

    pub fn next_validators(&self) -> Option<crate::world::ValidatorList> {
        self.outcome.lock().world_snapshot.as_ref().and_then(|s| s.validator_snapshot())
    }

    pub fn log_bloom(&self) -> Option<LogBloom> {
        if self.step() != Step::Complete {
            return None;
        }
        self.outcome.lock().log_bloom
    }

    pub fn patch_receipts(&self) -> Option<ReceiptList> {
        if self.step() != Step::Complete {
            return None;
        }
        self.outcome.lock().patch_receipts.clone()
    }

    pub fn normal_receipts(&self) -> Option<ReceiptList> {
        if self.step() != Step::Complete {
            return None;
        }
        self.outcome.lock().normal_receipts.clone()
    }

    pub fn world_snapshot(&self) -> Option<WorldSnapshot> {
        self.outcome.lock().world_snapshot.clone()
    }

    /// Flushes a completed transition's result to persistent storage and
    /// drops the parent pointer, releasing the retained snapshot chain.
    /// `flush_result` gates both: there is nothing else left to finalize
    /// selectively once a transition has completed.
    pub fn finalize(&self, flush_result: bool) -> Result<()> {
        if flush_result {
            if let Some(snapshot) = self.outcome.lock().world_snapshot.as_ref() {
                snapshot.flush(self.db.as_ref())?;
            }
            *self.parent.lock() = None;
        }
        Ok(())
    }

    /// Idempotent: sets step to `Canceled` only if not already terminal.
    /// Canceling a transition that already reached `Complete`/`Error` is a
    /// no-op and still returns `true`.
    pub fn cancel(&self) -> bool {
        cancel_step(&self.step)
    }
}

fn cancel_step(step: &Mutex<Step>) -> bool {
    let mut guard = step.lock();
    if !guard.is_terminal() {
        *guard = Step::Canceled;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Transaction;
    use crate::handler::HandlerKind;
    use crate::kvstore::MemoryDatabase;
    use std::sync::mpsc::TryRecvError;

    fn addr(b: u8) -> crate::world::PublicAddress {
        [b; 32]
    }

    fn transfer(from: u8, to: u8, value: u32, nonce: u64) -> Transaction {
        Transaction {
            id: [nonce as u8; 32],
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

    fn genesis(db: Arc<dyn Database>, seed_balance: u32) -> Arc<Transition> {
        let mut world = WorldState::new(None);
        world
            .account_state(addr(0))
            .set_balance(BigUint::from(seed_balance) + BigUint::from(21_000u32));
        let snapshot = world.get_snapshot();
        Arc::new(Transition {
            parent: Mutex::new(None),
            db,
            block_info: BlockInfo { height: 0, timestamp: 0 },
            patch_transactions: TransactionList::default(),
            normal_transactions: TransactionList::default(),
            step: Arc::new(Mutex::new(Step::Complete)),
            started: AtomicBool::new(true),
            outcome: Mutex::new(Outcome {
                result: None,
                world_snapshot: Some(snapshot),
                patch_receipts: Some(ReceiptList::empty()),
                normal_receipts: Some(ReceiptList::empty()),
                log_bloom: Some(LogBloom::default()),
            }),
        })
    }

    #[test]
    fn empty_block_completes_with_unchanged_state() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let parent = Transition::new_init(db, None, None).unwrap();
        let parent_hash = parent.world_snapshot().unwrap().state_hash();

        let child = Transition::new(
            parent,
            TransactionList::default(),
            TransactionList::default(),
            BlockInfo { height: 1, timestamp: 1 },
            false,
            ConsensusInfo,
        );

        let (cb, rx) = ChannelCallback::new_pair();
        child.execute(Box::new(cb)).unwrap();
        rx.recv().unwrap().unwrap();
        rx.recv().unwrap().unwrap();

        assert_eq!(child.step(), Step::Complete);
        assert_eq!(child.world_snapshot().unwrap().state_hash(), parent_hash);
        assert_eq!(child.normal_receipts().unwrap().len(), 0);
    }

    #[test]
    fn single_transfer_updates_balances_and_completes() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let parent = genesis(db, 1_000);

        let tx = transfer(0, 1, 100, 0);
        let child = Transition::new(
            parent,
            TransactionList::default(),
            TransactionList::new(vec![tx]),
            BlockInfo { height: 1, timestamp: 1 },
            false,
            ConsensusInfo,
        );

        let (cb, rx) = ChannelCallback::new_pair();
        child.execute(Box::new(cb)).unwrap();
        rx.recv().unwrap().unwrap();
        rx.recv().unwrap().unwrap();

        assert_eq!(child.step(), Step::Complete);
        let receipts = child.normal_receipts().unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts.get(0).unwrap().status, crate::block::Status::Success);
        assert_eq!(
            child.world_snapshot().unwrap().account(&addr(1)).balance,
            BigUint::from(100u32)
        );
    }

    #[test]
    fn validation_failure_surfaces_on_validate_and_never_fires_on_execute() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let parent = Transition::new_init(db, None, None).unwrap();

        // sender has zero balance: PreValidate rejects for insufficient funds
        let tx = transfer(9, 1, 100, 0);
        let child = Transition::new(
            parent,
            TransactionList::default(),
            TransactionList::new(vec![tx]),
            BlockInfo { height: 1, timestamp: 1 },
            false,
            ConsensusInfo,
        );

        let (cb, rx) = ChannelCallback::new_pair();
        child.execute(Box::new(cb)).unwrap();
        let first = rx.recv().unwrap();
        assert!(first.is_err());
        assert_eq!(child.step(), Step::Error);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn cancel_mid_execution_suppresses_on_execute() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let parent = genesis(db, 1_000_000);

        let txs: Vec<Transaction> = (0..100u64).map(|n| transfer(0, 1, 1, n)).collect();
        let child = Transition::new(
            parent,
            TransactionList::default(),
            TransactionList::new(txs),
            BlockInfo { height: 1, timestamp: 1 },
            false,
            ConsensusInfo,
        );

        assert!(child.cancel());
        assert_eq!(child.step(), Step::Canceled);

        let (cb, rx) = ChannelCallback::new_pair();
        child.execute(Box::new(cb)).unwrap();
        let first = rx.recv();
        if let Ok(r) = first {
            assert!(r.is_err());
        }
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }
}
