//! Transaction log
//!
//! Append-only history of every mutation, banknote verification and
//! redemption, and rollback.
//!
//! A rollback runs under a per-transaction async mutex (and the banknote's,
//! for banknote withdrawals), applies its compensation through the engine,
//! waits for the ROLLBACK entry to be durable, and only then marks the
//! original entry reverted. The store's conditional `mark_reverted` is the
//! second guard.

use crate::engine::{LedgerEngine, Receipt};
use crate::storage::{LogStore, WriteOp};
use crate::types::{AccountId, LogCategory, LogRecord, TransactionLogEntry, TransactionType};
use crate::writer::Commit;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Inverse mutation for a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Move the entry's amount; either side may be absent
    Move {
        /// Account debited by the rollback
        debit: Option<AccountId>,
        /// Account credited by the rollback
        credit: Option<AccountId>,
    },
    /// Put a balance back to a recorded value
    Restore {
        /// Account
        account: AccountId,
        /// Balance to restore
        balance: Decimal,
    },
}

impl Compensation {
    /// Compensation undoing `entry`
    pub fn for_entry(entry: &TransactionLogEntry) -> Result<Self> {
        let receiver = entry.receiver.ok_or_else(|| {
            Error::Irreversible(format!("{} entry {} has no receiver", entry.kind, entry.transaction_id))
        })?;

        match entry.kind {
            TransactionType::Pay => {
                let payer = entry.sender.ok_or_else(|| {
                    Error::Irreversible(format!("PAY entry {} has no sender", entry.transaction_id))
                })?;
                Ok(Compensation::Move { debit: Some(receiver), credit: Some(payer) })
            }
            TransactionType::Deposit | TransactionType::Give => {
                Ok(Compensation::Move { debit: Some(receiver), credit: None })
            }
            TransactionType::Withdraw | TransactionType::Take => {
                Ok(Compensation::Move { debit: None, credit: Some(receiver) })
            }
            TransactionType::Set => match entry.old_balance {
                Some(balance) => Ok(Compensation::Restore { account: receiver, balance }),
                None => Err(Error::Irreversible(format!(
                    "SET entry {} has no previous balance",
                    entry.transaction_id
                ))),
            },
            TransactionType::Rollback => Err(Error::Irreversible(format!(
                "ROLLBACK entry {} cannot be reverted",
                entry.transaction_id
            ))),
        }
    }

    /// Accounts whose balances the compensation touches
    pub fn accounts(&self) -> Vec<AccountId> {
        match *self {
            Compensation::Move { debit, credit } => debit.into_iter().chain(credit).collect(),
            Compensation::Restore { account, .. } => vec![account],
        }
    }

    fn sides(&self) -> (Option<AccountId>, Option<AccountId>) {
        match *self {
            Compensation::Move { debit, credit } => (debit, credit),
            Compensation::Restore { account, .. } => (None, Some(account)),
        }
    }
}

/// Outcome of a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReceipt {
    /// Reverted transaction
    pub original: Uuid,
    /// Kind of the reverted transaction
    pub kind: TransactionType,
    /// Transaction id of the ROLLBACK entry
    pub rollback_id: Uuid,
}

/// Outcome of a bulk rollback
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Rolled back transactions, newest first
    pub reverted: Vec<RollbackReceipt>,
    /// Transactions that could not be rolled back
    pub failed: Vec<(Uuid, Error)>,
}

impl RollbackReport {
    /// Whether every candidate was rolled back
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Async mutex per key, dropped from the map when the last holder leaves
#[derive(Debug, Default)]
struct KeyedMutex {
    slots: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl KeyedMutex {
    async fn lock(&self, key: Uuid) -> KeyGuard<'_> {
        let slot = self.slots.entry(key).or_default().clone();
        let guard = slot.lock_owned().await;
        KeyGuard { owner: self, key, guard: Some(guard) }
    }
}

struct KeyGuard<'a> {
    owner: &'a KeyedMutex,
    key: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.slots.remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Transaction log over the engine's write-behind path and durable store
#[derive(Debug)]
pub struct TransactionLog {
    engine: Arc<LedgerEngine>,
    transactions: KeyedMutex,
    banknotes: KeyedMutex,
}

impl TransactionLog {
    /// Create a log bound to `engine`
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine, transactions: KeyedMutex::default(), banknotes: KeyedMutex::default() }
    }

    /// Append a record without touching balances
    pub fn record(&self, record: LogRecord) -> Commit {
        let mut commit = Commit::default();
        commit.push(self.engine.writer.submit(WriteOp::AppendLog(record)));
        commit
    }

    /// Entries involving `account`, newest first. Pages start at 1.
    pub async fn history(
        &self,
        account: &AccountId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<TransactionLogEntry>> {
        let offset = u64::from(page.max(1) - 1) * u64::from(page_size);
        self.engine.writer.flush().await?;
        self.engine.store.history(account, offset, u64::from(page_size)).await
    }

    /// Entry for a transaction id
    pub async fn transaction(&self, transaction_id: Uuid) -> Result<TransactionLogEntry> {
        self.engine.writer.flush().await?;
        self.engine
            .store
            .find_transaction(transaction_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))
    }

    /// Every entry carrying a banknote id
    pub async fn by_banknote(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>> {
        self.engine.writer.flush().await?;
        self.engine.store.find_by_banknote(banknote_id).await
    }

    /// Check that a banknote can be redeemed; returns its WITHDRAW entry
    pub async fn verify_banknote(&self, banknote_id: Uuid) -> Result<TransactionLogEntry> {
        let entries = self.by_banknote(banknote_id).await?;

        if entries
            .iter()
            .any(|e| e.kind == TransactionType::Deposit && !e.reverted)
        {
            return Err(Error::AlreadyRedeemed(banknote_id));
        }

        let issued = entries
            .into_iter()
            .find(|e| e.kind == TransactionType::Withdraw)
            .ok_or_else(|| Error::NotFound(format!("banknote {}", banknote_id)))?;
        if issued.reverted {
            return Err(Error::AlreadyReverted(issued.transaction_id));
        }
        Ok(issued)
    }

    /// Deposit a banknote's value into `account` and wait until durable
    pub async fn redeem_banknote(&self, account: &AccountId, banknote_id: Uuid) -> Result<Receipt> {
        let _note = self.banknotes.lock(banknote_id).await;

        let issued = self.verify_banknote(banknote_id).await?;
        let Receipt { transaction_id, previous_balance, balance, commit } = self.engine.deposit_banknote(
            account,
            issued.currency.as_str(),
            issued.amount,
            banknote_id,
        )?;
        commit.wait().await?;

        tracing::info!(
            account = %account,
            banknote = %banknote_id,
            currency = %issued.currency,
            amount = %issued.amount,
            "Banknote redeemed"
        );
        Ok(Receipt { transaction_id, previous_balance, balance, commit: Commit::default() })
    }

    /// Apply the inverse of a transaction and mark it reverted
    pub async fn rollback(&self, transaction_id: Uuid) -> Result<RollbackReceipt> {
        let _transaction = self.transactions.lock(transaction_id).await;

        let entry = self.transaction(transaction_id).await?;
        if entry.reverted {
            return Err(Error::AlreadyReverted(transaction_id));
        }
        let plan = Compensation::for_entry(&entry)?;

        let _note = match entry.banknote_id {
            Some(banknote_id) if entry.kind == TransactionType::Withdraw => {
                let guard = self.banknotes.lock(banknote_id).await;
                let redeemed = self.by_banknote(banknote_id).await?.into_iter().any(|e| {
                    e.kind == TransactionType::Deposit && !e.reverted
                });
                if redeemed {
                    return Err(Error::AlreadyRedeemed(banknote_id));
                }
                Some(guard)
            }
            _ => None,
        };

        let mut attached = Vec::new();
        let mut result = Ok(());
        for account in plan.accounts() {
            match self.engine.attach(&account).await {
                Ok(true) => attached.push(account),
                Ok(false) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let result = match result {
            Ok(()) => self.compensate(&entry, &plan).await,
            Err(e) => Err(e),
        };

        for account in attached {
            if let Err(e) = self.engine.detach(&account).await {
                tracing::warn!(account = %account, error = %e, "Failed to release account attached for rollback");
            }
        }

        match &result {
            Ok(receipt) => {
                self.engine.metrics.record_rollback();
                tracing::info!(
                    transaction = %transaction_id,
                    kind = entry.kind.as_str(),
                    rollback = %receipt.rollback_id,
                    "Transaction rolled back"
                );
            }
            Err(e) if e.is_rejection() => {
                self.engine.metrics.record_rejection(e.reason());
                tracing::debug!(transaction = %transaction_id, reason = e.reason(), "Rollback rejected");
            }
            Err(e) => tracing::error!(transaction = %transaction_id, error = %e, "Rollback failed"),
        }
        result
    }

    async fn compensate(&self, entry: &TransactionLogEntry, plan: &Compensation) -> Result<RollbackReceipt> {
        let amount = match plan {
            Compensation::Restore { balance, .. } => *balance,
            Compensation::Move { .. } => entry.amount,
        };
        let (debit, credit) = plan.sides();

        let mut record = LogRecord::new(TransactionType::Rollback, entry.currency.clone(), amount)
            .with_sender(debit)
            .with_receiver(credit);
        record.reverts = Some(entry.transaction_id);
        record.note = Some(format!("rollback of {} {}", entry.kind, entry.transaction_id));
        let rollback_id = record.transaction_id;

        let commit = self
            .engine
            .apply_compensation(plan, &entry.currency, entry.amount, record)?;
        commit.wait().await?;

        if !self.engine.store.mark_reverted(entry.transaction_id).await? {
            tracing::error!(
                transaction = %entry.transaction_id,
                rollback = %rollback_id,
                currency = %entry.currency,
                amount = %entry.amount,
                "Compensation applied but entry was already marked reverted"
            );
            return Err(Error::Integrity(format!(
                "transaction {} was reverted concurrently; rollback {} needs manual reconciliation",
                entry.transaction_id, rollback_id
            )));
        }

        Ok(RollbackReceipt { original: entry.transaction_id, kind: entry.kind, rollback_id })
    }

    /// Roll back, newest first, every unreverted entry involving `account`
    /// since `since` in `category`. Failures do not stop the run.
    pub async fn rollback_since(
        &self,
        account: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<RollbackReport> {
        self.engine.writer.flush().await?;
        let candidates = self.engine.store.entries_since(account, since, category).await?;

        let mut report = RollbackReport::default();
        for entry in candidates {
            if entry.reverted || entry.kind == TransactionType::Rollback {
                continue;
            }
            match self.rollback(entry.transaction_id).await {
                Ok(receipt) => report.reverted.push(receipt),
                Err(e) => report.failed.push((entry.transaction_id, e)),
            }
        }

        tracing::info!(
            account = %account,
            since = %since,
            reverted = report.reverted.len(),
            failed = report.failed.len(),
            "Bulk rollback finished"
        );
        Ok(report)
    }
}
