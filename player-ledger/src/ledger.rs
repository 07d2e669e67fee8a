//! Ledger facade
//!
//! Wires the engine, write-behind worker, transaction log and leaderboard
//! together from a [`Config`] and exposes the in-process API front ends
//! call.
//!
//! # Example
//!
//! ```no_run
//! use player_ledger::{AccountId, Config, Ledger};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> player_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let alex = AccountId::new_v4();
//!     ledger.load_or_create(alex, "Alex").await?;
//!
//!     let receipt = ledger.deposit(&alex, "dollar", Decimal::new(250, 0))?;
//!     receipt.commit.wait().await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::config::Config;
use crate::currency::{Currency, CurrencyRegistry};
use crate::engine::{LedgerEngine, Receipt, TransferReceipt};
use crate::leaderboard::LeaderboardCache;
use crate::metrics::Metrics;
use crate::policy::ConfiguredPolicy;
use crate::storage::{AccountStore, Backend, SqliteStore};
use crate::txlog::{RollbackReceipt, RollbackReport, TransactionLog};
use crate::types::{
    Account, AccountId, DataDump, LeaderboardEntry, LogCategory, TransactionLogEntry,
};
use crate::writer::{spawn_writer, WriterHandle};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of copying one backend into another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Users copied
    pub users: usize,
    /// Balance rows copied
    pub balances: usize,
    /// Wall time taken
    pub elapsed: Duration,
}

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    engine: Arc<LedgerEngine>,
    log: TransactionLog,
    leaderboard: Arc<LeaderboardCache>,
    policy: Arc<ConfiguredPolicy>,
    store: Arc<dyn Backend>,
    writer: WriterHandle,
    metrics: Metrics,
    refresher: Mutex<Option<JoinHandle<()>>>,
    config: Config,
}

impl Ledger {
    /// Open a ledger on the configured SQLite database
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store =
            SqliteStore::connect(&config.storage.database_url, config.storage.max_connections)
                .await?;
        let schema_version = store.schema_version().await?;
        tracing::info!(
            database = %config.storage.database_url,
            schema_version,
            "Storage ready"
        );

        Self::with_store(config, Arc::new(store))
    }

    /// Build a ledger over any backend. Must run inside a Tokio runtime.
    pub fn with_store(config: Config, store: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;
        let currencies = Arc::new(CurrencyRegistry::new(config.currencies.clone())?);
        let policy = Arc::new(ConfiguredPolicy::new(&config.economy));
        let writer = spawn_writer(store.clone(), &config.write_behind, metrics.clone());

        let engine = Arc::new(LedgerEngine::new(
            store.clone(),
            writer.clone(),
            currencies.clone(),
            policy.clone(),
            metrics.clone(),
            config.economy.start_balance,
        ));
        let log = TransactionLog::new(engine.clone());
        let leaderboard = Arc::new(LeaderboardCache::new(
            store.clone(),
            currencies,
            config.leaderboard.clone(),
            metrics.clone(),
        ));

        let refresher = match config.leaderboard.refresh_interval_secs {
            Some(secs) if config.leaderboard.enabled && secs > 0 => {
                Some(leaderboard.clone().spawn_refresher(Duration::from_secs(secs)))
            }
            _ => None,
        };

        tracing::info!(
            service = %config.service_name,
            backend = store.name(),
            "Ledger started"
        );

        Ok(Self {
            engine,
            log,
            leaderboard,
            policy,
            store,
            writer,
            metrics,
            refresher: Mutex::new(refresher),
            config,
        })
    }

    /// Configuration the ledger was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Per-account debt limit and cap overrides
    pub fn policy(&self) -> &ConfiguredPolicy {
        &self.policy
    }

    /// Transaction log
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    // ===== Session lifecycle =====

    /// Load an account into the working set, creating it if new
    pub async fn load_or_create(&self, id: AccountId, display_name: &str) -> Result<Account> {
        self.engine.load_or_create(id, display_name).await
    }

    /// Hold an existing offline account in the working set; pair every
    /// `true` result with [`detach`](Self::detach)
    pub async fn attach(&self, id: &AccountId) -> Result<bool> {
        self.engine.attach(id).await
    }

    /// Release a hold taken by [`attach`](Self::attach)
    pub async fn detach(&self, id: &AccountId) -> Result<()> {
        self.engine.detach(id).await
    }

    /// Flush an account and drop it from the working set
    pub async fn evict(&self, id: &AccountId) -> Result<()> {
        self.engine.evict(id).await
    }

    /// Resolve a display name to an account id
    pub async fn find_account(&self, display_name: &str) -> Result<Option<AccountId>> {
        self.engine.find_account(display_name).await
    }

    // ===== Cache queries =====

    /// Whether the account is in the working set
    pub fn has_account(&self, id: &AccountId) -> bool {
        self.engine.has_account(id)
    }

    /// Cached balance
    pub fn get_balance(&self, id: &AccountId, currency: &str) -> Result<Decimal> {
        self.engine.get_balance(id, currency)
    }

    /// Cached balance rendered with the currency's symbol and pattern
    pub fn format_balance(&self, id: &AccountId, currency: &str) -> Result<String> {
        let balance = self.engine.get_balance(id, currency)?;
        let snapshot = self.engine.currencies().snapshot();
        Ok(snapshot.get(currency)?.format(balance))
    }

    // ===== Mutations =====
    //
    // Applied to the cache before returning. Await `commit` on the receipt
    // when the write must be durable.

    /// Credit an account
    pub fn deposit(&self, id: &AccountId, currency: &str, amount: Decimal) -> Result<Receipt> {
        self.engine.deposit(id, currency, amount)
    }

    /// Debit an account
    pub fn withdraw(&self, id: &AccountId, currency: &str, amount: Decimal) -> Result<Receipt> {
        self.engine.withdraw(id, currency, amount)
    }

    /// Debit an account into a new banknote
    pub fn withdraw_banknote(
        &self,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<(Uuid, Receipt)> {
        self.engine.withdraw_banknote(id, currency, amount)
    }

    /// Replace a balance
    pub fn set_balance(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        self.engine.set_balance(actor, id, currency, amount)
    }

    /// Administrative credit
    pub fn give(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        self.engine.give(actor, id, currency, amount)
    }

    /// Administrative debit
    pub fn take(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        self.engine.take(actor, id, currency, amount)
    }

    /// Pay another account
    pub fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        self.engine.transfer(from, to, currency, amount)
    }

    // ===== History and audit =====

    /// Entries involving an account, newest first; pages start at 1
    pub async fn get_history(
        &self,
        id: &AccountId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<TransactionLogEntry>> {
        self.log.history(id, page, page_size).await
    }

    /// Entry for a transaction id
    pub async fn get_transaction(&self, transaction_id: Uuid) -> Result<TransactionLogEntry> {
        self.log.transaction(transaction_id).await
    }

    /// Entries carrying a banknote id
    pub async fn get_by_banknote_id(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>> {
        self.log.by_banknote(banknote_id).await
    }

    /// Check a banknote can still be redeemed
    pub async fn verify_banknote(&self, banknote_id: Uuid) -> Result<TransactionLogEntry> {
        self.log.verify_banknote(banknote_id).await
    }

    /// Redeem a banknote into an account
    pub async fn redeem_banknote(&self, id: &AccountId, banknote_id: Uuid) -> Result<Receipt> {
        self.log.redeem_banknote(id, banknote_id).await
    }

    /// Revert a transaction
    pub async fn rollback(&self, transaction_id: Uuid) -> Result<RollbackReceipt> {
        self.log.rollback(transaction_id).await
    }

    /// Revert every matching entry for an account since a point in time
    pub async fn rollback_since(
        &self,
        id: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<RollbackReport> {
        self.log.rollback_since(id, since, category).await
    }

    // ===== Leaderboard =====

    /// Top balances for a currency
    pub async fn get_top(&self, currency: &str) -> Result<Arc<Vec<LeaderboardEntry>>> {
        self.leaderboard.get_top(currency).await
    }

    /// One leaderboard page; pages start at 1
    pub async fn leaderboard_page(&self, currency: &str, page: u32) -> Result<Vec<LeaderboardEntry>> {
        self.leaderboard.page(currency, page).await
    }

    /// Leaderboard cache
    pub fn leaderboard(&self) -> &LeaderboardCache {
        &self.leaderboard
    }

    // ===== Administration =====

    /// Swap in a new currency set; the old one stays if the new one is invalid
    pub fn reload_currencies(&self, currencies: Vec<Currency>) -> Result<()> {
        self.engine.currencies().reload(currencies)
    }

    /// Every user and balance row in the durable store
    pub async fn dump_all_data(&self) -> Result<DataDump> {
        self.writer.flush().await?;
        self.store.dump_all().await
    }

    /// Import a dump into the durable store. Fails without writing if any
    /// account named in the dump is in the working set.
    pub async fn import_data(&self, dump: &DataDump) -> Result<()> {
        let cached = dump
            .users
            .iter()
            .map(|u| &u.account_id)
            .chain(dump.balances.iter().map(|b| &b.account_id))
            .find(|id| self.engine.has_account(id));
        if let Some(id) = cached {
            tracing::warn!(account = %id, "Import rejected, account is in the working set");
            return Err(Error::Concurrency(format!(
                "cannot import over loaded account {}; evict it first",
                id
            )));
        }

        self.writer.flush().await?;
        self.store.import(dump).await?;
        tracing::info!(
            users = dump.users.len(),
            balances = dump.balances.len(),
            "Data imported"
        );
        Ok(())
    }

    /// Copy the durable store into another backend
    pub async fn migrate_to(&self, target: &dyn Backend) -> Result<MigrationReport> {
        let started = Instant::now();
        let dump = self.dump_all_data().await?;
        target.import(&dump).await?;

        let report = MigrationReport {
            users: dump.users.len(),
            balances: dump.balances.len(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            from = self.store.name(),
            to = target.name(),
            users = report.users,
            balances = report.balances,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Migration finished"
        );
        Ok(report)
    }

    /// Evict every account, drain the writer and stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.abort();
        }

        let evicted = self.engine.evict_all().await;
        self.writer.shutdown().await?;

        let evicted = evicted?;
        tracing::info!(evicted, "Ledger shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{BalanceRecord, CurrencyId, UserRecord};

    fn ledger() -> (Ledger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::with_store(Config::default(), store.clone()).unwrap();
        (ledger, store)
    }

    #[tokio::test]
    async fn test_ledger_roundtrip() {
        let (ledger, _) = ledger();
        let alex = AccountId::new_v4();

        ledger.load_or_create(alex, "Alex").await.unwrap();
        let receipt = ledger.deposit(&alex, "dollar", Decimal::new(23450, 2)).unwrap();
        receipt.commit.wait().await.unwrap();

        assert_eq!(ledger.format_balance(&alex, "dollar").unwrap(), "$1,234.50");
        assert_eq!(ledger.get_history(&alex, 1, 10).await.unwrap().len(), 1);
        assert_eq!(ledger.find_account("ALEX").await.unwrap(), Some(alex));
        assert_eq!(ledger.metrics().mutations_total.with_label_values(&["DEPOSIT"]).get(), 1);
    }

    #[tokio::test]
    async fn test_dump_import_and_migrate() {
        let (ledger, _) = ledger();
        let id = AccountId::new_v4();
        let dump = DataDump {
            users: vec![UserRecord { account_id: id, display_name: "Imported".to_string() }],
            balances: vec![BalanceRecord {
                account_id: id,
                currency: CurrencyId::new("dollar"),
                amount: Decimal::new(77, 0),
            }],
        };

        ledger.import_data(&dump).await.unwrap();
        let account = ledger.load_or_create(id, "Imported").await.unwrap();
        assert_eq!(account.balance(&CurrencyId::new("dollar")), Decimal::new(77, 0));

        let target = MemoryStore::new();
        let report = ledger.migrate_to(&target).await.unwrap();
        assert_eq!(report.users, 1);
        assert_eq!(report.balances, 1);
        assert_eq!(target.dump_all().await.unwrap(), ledger.dump_all_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_import_rejected_while_account_loaded() {
        let (ledger, store) = ledger();
        let alex = AccountId::new_v4();
        ledger.load_or_create(alex, "Alex").await.unwrap();
        ledger.deposit(&alex, "dollar", Decimal::new(5, 0)).unwrap();

        let dump = DataDump {
            users: Vec::new(),
            balances: vec![BalanceRecord {
                account_id: alex,
                currency: CurrencyId::new("dollar"),
                amount: Decimal::new(77, 0),
            }],
        };

        let err = ledger.import_data(&dump).await.unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
        assert_eq!(ledger.get_balance(&alex, "dollar").unwrap(), Decimal::new(1005, 0));

        ledger.evict(&alex).await.unwrap();
        ledger.import_data(&dump).await.unwrap();
        assert_eq!(
            store.balance(&alex, &CurrencyId::new("dollar")).await.unwrap(),
            Some(Decimal::new(77, 0))
        );
        let account = ledger.load_or_create(alex, "Alex").await.unwrap();
        assert_eq!(account.balance(&CurrencyId::new("dollar")), Decimal::new(77, 0));
    }

    #[tokio::test]
    async fn test_reload_currencies_keeps_old_set_on_error() {
        let (ledger, _) = ledger();
        let alex = AccountId::new_v4();
        ledger.load_or_create(alex, "Alex").await.unwrap();

        assert!(ledger.reload_currencies(vec![Currency::dollar(), Currency::dollar()]).is_err());
        assert!(ledger.get_balance(&alex, "dollar").is_ok());

        let mut gems = Currency::dollar();
        gems.id = CurrencyId::new("gems");
        gems.is_default = false;
        ledger.reload_currencies(vec![Currency::dollar(), gems]).unwrap();
        assert_eq!(ledger.get_balance(&alex, "gems").unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_persists_working_set() {
        let (ledger, store) = ledger();
        let alex = AccountId::new_v4();
        ledger.load_or_create(alex, "Alex").await.unwrap();
        ledger.withdraw(&alex, "dollar", Decimal::new(100, 0)).unwrap();

        ledger.shutdown().await.unwrap();
        assert!(!ledger.has_account(&alex));

        let stored = store.load(&alex).await.unwrap().unwrap();
        assert_eq!(stored.balance(&CurrencyId::new("dollar")), Decimal::new(900, 0));
    }
}
