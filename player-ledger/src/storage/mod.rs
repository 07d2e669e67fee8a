//! Durable storage contracts
//!
//! The ledger reaches its backend only through these async traits:
//!
//! - [`AccountStore`] - balance rows keyed by `(account, currency)` plus the name index
//! - [`LogStore`] - append-only transaction log
//! - [`Backend`] - both of the above, plus batched writes for the write-behind worker
//!
//! Two implementations ship with the crate: [`SqliteStore`] (reference SQL
//! backend) and [`MemoryStore`] (tests and embedded use).

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::types::{
    Account, AccountId, CurrencyId, DataDump, LogCategory, LogRecord, TransactionLogEntry,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Balance rows and name index
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Load an account with all of its balances
    async fn load(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Upsert the name row and every balance row of the account
    async fn save(&self, account: &Account) -> Result<()>;

    /// One balance row
    async fn balance(&self, id: &AccountId, currency: &CurrencyId) -> Result<Option<Decimal>>;

    /// Upsert one balance row
    async fn set_balance(&self, id: &AccountId, currency: &CurrencyId, amount: Decimal) -> Result<()>;

    /// Upsert the name index entry
    async fn update_name(&self, id: &AccountId, display_name: &str) -> Result<()>;

    /// Case-insensitive name lookup
    async fn find_by_name(&self, display_name: &str) -> Result<Option<AccountId>>;

    /// Highest balances in a currency as `(display name, balance)`, descending
    async fn top_balances(&self, currency: &CurrencyId, limit: u32) -> Result<Vec<(Option<String>, Decimal)>>;

    /// Every user and balance row
    async fn dump_all(&self) -> Result<DataDump>;

    /// Upsert every row of a dump, all or nothing
    async fn import(&self, dump: &DataDump) -> Result<()>;
}

/// Append-only transaction log
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a record, returning its log id
    async fn append_log(&self, record: &LogRecord) -> Result<i64>;

    /// Entries where the account is sender or receiver, newest first
    async fn history(&self, account: &AccountId, offset: u64, limit: u64) -> Result<Vec<TransactionLogEntry>>;

    /// First entry carrying the transaction id
    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<TransactionLogEntry>>;

    /// Every entry carrying the banknote id, oldest first
    async fn find_by_banknote(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>>;

    /// Set `reverted` if it is not set yet; returns whether this call set it
    async fn mark_reverted(&self, transaction_id: Uuid) -> Result<bool>;

    /// Unreverted entries involving the account since `since`, newest first
    async fn entries_since(
        &self,
        account: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<Vec<TransactionLogEntry>>;
}

/// A deferred write produced by the ledger engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Upsert one balance row
    SetBalance {
        /// Account
        account: AccountId,
        /// Currency
        currency: CurrencyId,
        /// New balance
        balance: Decimal,
    },

    /// Upsert an account snapshot
    SaveAccount(Account),

    /// Upsert the name index
    UpdateName {
        /// Account
        account: AccountId,
        /// Display name
        display_name: String,
    },

    /// Append a log record
    AppendLog(LogRecord),
}

impl WriteOp {
    /// Operation name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::SetBalance { .. } => "set_balance",
            WriteOp::SaveAccount(_) => "save_account",
            WriteOp::UpdateName { .. } => "update_name",
            WriteOp::AppendLog(_) => "append_log",
        }
    }
}

/// Complete durable backend
#[async_trait]
pub trait Backend: AccountStore + LogStore + std::fmt::Debug {
    /// Apply a batch of writes in order
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<()> {
        for op in ops {
            match op {
                WriteOp::SetBalance { account, currency, balance } => {
                    self.set_balance(account, currency, *balance).await?;
                }
                WriteOp::SaveAccount(account) => self.save(account).await?,
                WriteOp::UpdateName { account, display_name } => {
                    self.update_name(account, display_name).await?;
                }
                WriteOp::AppendLog(record) => {
                    self.append_log(record).await?;
                }
            }
        }
        Ok(())
    }

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}
