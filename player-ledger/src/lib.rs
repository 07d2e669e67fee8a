//! Player Ledger
//!
//! In-memory, multi-currency player balance ledger with write-behind
//! persistence, an append-only transaction log with rollback, and a cached
//! leaderboard.
//!
//! # Architecture
//!
//! - **Working set**: balances of connected accounts live in a concurrent
//!   map and are the authority while cached
//! - **Per-account locks**: one reader/writer lock per account; transfers
//!   take both in id order
//! - **Single writer**: one worker owns the durable store's write path and
//!   batches balance rows and log entries
//! - **Cache-aside leaderboard**: refreshed from the store, never from the
//!   working set
//!
//! # Invariants
//!
//! - Conservation: a PAY changes the sum of the two balances by zero
//! - Debt bound: no balance goes below `-debt_limit`, or below zero when
//!   negative balances are off
//! - Per-account ordering: durable writes for an account land in lock order
//! - Rollback idempotence: an entry is reverted at most once

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod cache;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod leaderboard;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod policy;
pub mod session;
pub mod storage;
pub mod txlog;
pub mod types;
pub mod writer;

// Re-exports
pub use config::Config;
pub use currency::{Currency, CurrencyRegistry};
pub use engine::{LedgerEngine, Receipt, TransferReceipt};
pub use error::{Error, Result};
pub use ledger::{Ledger, MigrationReport};
pub use policy::{BalancePolicy, ConfiguredPolicy};
pub use storage::{AccountStore, Backend, LogStore, MemoryStore, SqliteStore};
pub use txlog::{Compensation, RollbackReceipt, RollbackReport, TransactionLog};
pub use types::{
    Account, AccountId, CurrencyId, DataDump, LeaderboardEntry, LogCategory, LogRecord,
    TransactionLogEntry, TransactionType,
};
