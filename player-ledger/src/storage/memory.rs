//! In-memory backend

use super::{AccountStore, Backend, LogStore};
use crate::types::{
    Account, AccountId, BalanceRecord, CurrencyId, DataDump, LogCategory, LogRecord,
    TransactionLogEntry, UserRecord,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<AccountId, String>,
    balances: BTreeMap<(AccountId, CurrencyId), Decimal>,
    logs: Vec<TransactionLogEntry>,
}

/// Backend keeping every row in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries
    pub fn log_len(&self) -> usize {
        self.inner.read().logs.len()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn load(&self, id: &AccountId) -> Result<Option<Account>> {
        let inner = self.inner.read();
        let balances: BTreeMap<CurrencyId, Decimal> = inner
            .balances
            .iter()
            .filter(|((account, _), _)| account == id)
            .map(|((_, currency), amount)| (currency.clone(), *amount))
            .collect();

        match inner.users.get(id) {
            Some(name) => Ok(Some(Account { id: *id, display_name: name.clone(), balances })),
            None if !balances.is_empty() => {
                Ok(Some(Account { id: *id, display_name: String::new(), balances }))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, account: &Account) -> Result<()> {
        let mut inner = self.inner.write();
        inner.users.insert(account.id, account.display_name.clone());
        for (currency, amount) in &account.balances {
            inner.balances.insert((account.id, currency.clone()), *amount);
        }
        Ok(())
    }

    async fn balance(&self, id: &AccountId, currency: &CurrencyId) -> Result<Option<Decimal>> {
        Ok(self.inner.read().balances.get(&(*id, currency.clone())).copied())
    }

    async fn set_balance(&self, id: &AccountId, currency: &CurrencyId, amount: Decimal) -> Result<()> {
        self.inner.write().balances.insert((*id, currency.clone()), amount);
        Ok(())
    }

    async fn update_name(&self, id: &AccountId, display_name: &str) -> Result<()> {
        self.inner.write().users.insert(*id, display_name.to_string());
        Ok(())
    }

    async fn find_by_name(&self, display_name: &str) -> Result<Option<AccountId>> {
        let wanted = display_name.trim().to_lowercase();
        Ok(self
            .inner
            .read()
            .users
            .iter()
            .find(|(_, name)| name.to_lowercase() == wanted)
            .map(|(id, _)| *id))
    }

    async fn top_balances(&self, currency: &CurrencyId, limit: u32) -> Result<Vec<(Option<String>, Decimal)>> {
        let inner = self.inner.read();
        let mut rows: Vec<_> = inner
            .balances
            .iter()
            .filter(|((_, c), _)| c == currency)
            .map(|((id, _), amount)| (inner.users.get(id).cloned(), *amount))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn dump_all(&self) -> Result<DataDump> {
        let inner = self.inner.read();
        let mut users: Vec<_> = inner
            .users
            .iter()
            .map(|(id, name)| UserRecord { account_id: *id, display_name: name.clone() })
            .collect();
        users.sort_by_key(|u| u.account_id);

        let balances = inner
            .balances
            .iter()
            .map(|((id, currency), amount)| BalanceRecord {
                account_id: *id,
                currency: currency.clone(),
                amount: *amount,
            })
            .collect();

        Ok(DataDump { users, balances })
    }

    async fn import(&self, dump: &DataDump) -> Result<()> {
        let mut inner = self.inner.write();
        for user in &dump.users {
            inner.users.insert(user.account_id, user.display_name.clone());
        }
        for row in &dump.balances {
            inner.balances.insert((row.account_id, row.currency.clone()), row.amount);
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append_log(&self, record: &LogRecord) -> Result<i64> {
        let mut inner = self.inner.write();
        let log_id = inner.logs.len() as i64 + 1;
        inner.logs.push(TransactionLogEntry::from_record(log_id, record.clone()));
        Ok(log_id)
    }

    async fn history(&self, account: &AccountId, offset: u64, limit: u64) -> Result<Vec<TransactionLogEntry>> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.logs.iter().filter(|e| e.involves(account)).collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.log_id.cmp(&a.log_id)));
        Ok(entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<TransactionLogEntry>> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .find(|e| e.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_by_banknote(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .filter(|e| e.banknote_id == Some(banknote_id))
            .cloned()
            .collect())
    }

    async fn mark_reverted(&self, transaction_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner
            .logs
            .iter_mut()
            .find(|e| e.transaction_id == transaction_id && !e.reverted)
        {
            Some(entry) => {
                entry.reverted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn entries_since(
        &self,
        account: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<Vec<TransactionLogEntry>> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner
            .logs
            .iter()
            .filter(|e| {
                e.involves(account)
                    && e.timestamp >= since
                    && !e.reverted
                    && e.kind.in_category(category)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.log_id.cmp(&a.log_id)));
        Ok(entries)
    }
}

impl Backend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionType;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        let mut account = Account::new(AccountId::new_v4(), "Alex");
        account.set_balance(CurrencyId::new("dollar"), Decimal::new(1000, 0));

        store.save(&account).await.unwrap();

        assert_eq!(store.load(&account.id).await.unwrap(), Some(account.clone()));
        assert_eq!(store.find_by_name("ALEX").await.unwrap(), Some(account.id));
        assert!(store.load(&AccountId::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_reverted_only_once() {
        let store = MemoryStore::new();
        let record = LogRecord::new(TransactionType::Deposit, CurrencyId::new("dollar"), Decimal::ONE)
            .with_receiver(Some(AccountId::new_v4()));
        store.append_log(&record).await.unwrap();

        assert!(store.mark_reverted(record.transaction_id).await.unwrap());
        assert!(!store.mark_reverted(record.transaction_id).await.unwrap());
        assert!(store.find_transaction(record.transaction_id).await.unwrap().unwrap().reverted);
    }

    #[tokio::test]
    async fn test_top_balances_descending() {
        let store = MemoryStore::new();
        let dollar = CurrencyId::new("dollar");
        for (name, amount) in [("a", 5), ("b", 50), ("c", 20)] {
            let mut account = Account::new(AccountId::new_v4(), name);
            account.set_balance(dollar.clone(), Decimal::new(amount, 0));
            store.save(&account).await.unwrap();
        }

        let top = store.top_balances(&dollar, 2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], (Some("b".to_string()), Decimal::new(50, 0)));
        assert_eq!(top[1].1, Decimal::new(20, 0));
    }
}
