/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! `transition-core` is the block execution and transition pipeline of a
//! blockchain node: given a sequence of historical blocks and a current
//! world state, it re-derives each block's resulting state, receipts, and
//! validator set, persists them, and verifies that the computed receipts
//! match the receipts the original network produced.
//!
//! ## Layout
//!
//! - [kvstore] — append-only bucketed byte storage (C1).
//! - [world] — the mutable account/validator tree and its immutable,
//!   content-addressed snapshots (C2).
//! - [handler] — the transaction-handler capability consumed as an opaque
//!   `Execute(context) -> receipt` contract (C3).
//! - [transition] — the `Transition` state machine that drives one block
//!   from a parent snapshot to a completed (or errored, or canceled) result
//!   (C4).
//! - [executor] — the outer replay loop: propose, execute, verify against
//!   an authoritative oracle, finalize, advance (C5).
//! - [block] — `Block`, `TransactionList`, `ReceiptList` and their contents.
//! - [oracle] — the remote block source and its content-addressed cache.
//! - [codec] — the project's canonical deterministic binary encoding.
//! - [error] — the crate-wide error taxonomy.
//!
//! ## Usage
//!
//! Build a [kvstore::Database], an implementation of [oracle::RemoteOracle],
//! hand both to [executor::Executor::new], then call
//! [executor::Executor::execute] with the height range to replay. The
//! `executor` binary in this crate wires this up as a CLI.

pub mod block;
pub mod codec;
pub mod error;
pub mod executor;
pub mod handler;
pub mod kvstore;
pub mod oracle;
pub mod transition;
pub mod world;

pub use error::{Error, Result};
pub use executor::Executor;
pub use transition::{Transition, TransitionResult};
