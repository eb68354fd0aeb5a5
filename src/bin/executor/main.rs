/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! CLI import driver: a single `execute` subcommand that
//! replays a height range against a local legacy-chain store and persists
//! the result into a RocksDB-backed database under `--data`.
//!
//! The wire protocol for fetching blocks from a live archival peer is out
//! of scope for this crate (see `crate::oracle`); this binary instead reads
//! pre-synced block+receipt JSON files from `<data>/lc/<height>.json`, the
//! on-disk shape a local chain store would already hold after a sync pass —
//! mirroring the "consumed as an authoritative block + receipts by height
//! oracle" contract without implementing the network sync protocol itself.

mod file_oracle;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use transition_core::error::Error;
use transition_core::executor::Executor;
use transition_core::kvstore::{Database, RocksDbDatabase};
use transition_core::oracle::CachingOracle;

use file_oracle::FileOracle;

#[derive(Parser, Debug)]
#[command(name = "executor", about = "Replay historical blocks through the transition pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay `[from, to]` against the local chain store, verifying computed
    /// receipts against the authoritative ones along the way.
    Execute {
        /// First height to replay. -1 resumes from the last persisted height.
        #[arg(long, default_value_t = -1)]
        from: i64,

        /// Last height to replay, inclusive. -1 runs until interrupted.
        #[arg(long, default_value_t = -1)]
        to: i64,

        /// Data directory: holds the RocksDB database and the `lc/`
        /// pre-synced legacy chain store read by the file oracle.
        #[arg(long)]
        data: PathBuf,

        /// Skip the local cache and re-derive every height from the chain
        /// store, even ones already finalized in a previous run.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        tracing::error!(error = ?e, "executor run failed");
        std::process::exit(1);
    }
}

/// The library surface stays on its own `error::Error` enum so downstream
/// callers aren't forced onto `anyhow::Error`; this binary is the one place
/// that wraps it with `anyhow::Context` for a human-readable failure chain.
fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Execute { from, to, data, no_cache } => execute(from, to, data, no_cache)
            .with_context(|| format!("executing from={from} to={to} data={}", data.display())),
    }
}

fn execute(from: i64, to: i64, data: PathBuf, no_cache: bool) -> transition_core::error::Result<()> {
    if !data.exists() {
        return Err(Error::Configuration(format!(
            "data directory does not exist: {}",
            data.display()
        )));
    }

    let db_path = data.join("database");
    let db: Arc<dyn Database> = Arc::new(RocksDbDatabase::open(&db_path)?);

    let lc_path = data.join("lc");
    let file_oracle = FileOracle::open(&lc_path)?;
    let oracle = CachingOracle::new(file_oracle, db.clone());

    let executor = Executor::new(db, oracle)?;
    tracing::info!(
        engine_manager = ?executor.engine_manager(),
        socket = %data.join("ee.sock").display(),
        "wiring contract-engine manager (socket is never dialed by this crate)"
    );

    let from = if from < 0 { None } else { Some(from as u64) };
    let to = if to < 0 { None } else { Some(to) };

    // The core installs no OS signal handlers; cancellation between heights
    // is exposed purely as this flag for an embedding caller to flip. A
    // standalone CLI run has no other caller, so it never sets it and
    // simply runs to completion.
    let cancel = AtomicBool::new(false);

    executor.execute(from, to, !no_cache, &cancel)
}
