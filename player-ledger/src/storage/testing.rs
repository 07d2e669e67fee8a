//! Fault-injecting backend for tests

use super::{AccountStore, Backend, LogStore, MemoryStore, WriteOp};
use crate::types::{
    Account, AccountId, CurrencyId, DataDump, LogCategory, LogRecord, TransactionLogEntry,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Memory store whose batch writes can be slowed down or made to fail
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryStore,
    failures_left: AtomicU32,
    batch_delay: Mutex<Duration>,
}

impl FaultyStore {
    /// Fail the next `count` batch writes
    pub(crate) fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Sleep this long before every batch write
    pub(crate) fn set_batch_delay(&self, delay: Duration) {
        *self.batch_delay.lock() = delay;
    }
}

#[async_trait]
impl AccountStore for FaultyStore {
    async fn load(&self, id: &AccountId) -> Result<Option<Account>> {
        self.inner.load(id).await
    }
    async fn save(&self, account: &Account) -> Result<()> {
        self.inner.save(account).await
    }
    async fn balance(&self, id: &AccountId, currency: &CurrencyId) -> Result<Option<Decimal>> {
        self.inner.balance(id, currency).await
    }
    async fn set_balance(&self, id: &AccountId, currency: &CurrencyId, amount: Decimal) -> Result<()> {
        self.inner.set_balance(id, currency, amount).await
    }
    async fn update_name(&self, id: &AccountId, display_name: &str) -> Result<()> {
        self.inner.update_name(id, display_name).await
    }
    async fn find_by_name(&self, display_name: &str) -> Result<Option<AccountId>> {
        self.inner.find_by_name(display_name).await
    }
    async fn top_balances(&self, currency: &CurrencyId, limit: u32) -> Result<Vec<(Option<String>, Decimal)>> {
        self.inner.top_balances(currency, limit).await
    }
    async fn dump_all(&self) -> Result<DataDump> {
        self.inner.dump_all().await
    }
    async fn import(&self, dump: &DataDump) -> Result<()> {
        self.inner.import(dump).await
    }
}

#[async_trait]
impl LogStore for FaultyStore {
    async fn append_log(&self, record: &LogRecord) -> Result<i64> {
        self.inner.append_log(record).await
    }
    async fn history(&self, account: &AccountId, offset: u64, limit: u64) -> Result<Vec<TransactionLogEntry>> {
        self.inner.history(account, offset, limit).await
    }
    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<TransactionLogEntry>> {
        self.inner.find_transaction(transaction_id).await
    }
    async fn find_by_banknote(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>> {
        self.inner.find_by_banknote(banknote_id).await
    }
    async fn mark_reverted(&self, transaction_id: Uuid) -> Result<bool> {
        self.inner.mark_reverted(transaction_id).await
    }
    async fn entries_since(
        &self,
        account: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<Vec<TransactionLogEntry>> {
        self.inner.entries_since(account, since, category).await
    }
}

#[async_trait]
impl Backend for FaultyStore {
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<()> {
        let delay = *self.batch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Storage("disk unavailable".to_string()));
        }
        self.inner.apply_batch(ops).await
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}
