//! Ledger engine
//!
//! Every balance mutation goes through here. The fixed sequence is:
//!
//! 1. amount check
//! 2. account presence in the [`AccountCache`]
//! 3. currency lookup in the [`CurrencyRegistry`]
//! 4. account write lock (two locks in id order for transfers)
//! 5. funds / debt-limit / cap check against the cached balance
//! 6. cache update, then balance row and log entry queued on the
//!    write-behind worker before the lock is released
//!
//! Validation errors come back synchronously. Durable failures come back
//! through the [`Commit`] in the receipt.

use crate::cache::AccountCache;
use crate::currency::CurrencyRegistry;
use crate::locks::LockTable;
use crate::metrics::Metrics;
use crate::policy::BalancePolicy;
use crate::storage::{Backend, WriteOp};
use crate::txlog::Compensation;
use crate::types::{Account, AccountId, CurrencyId, LogRecord, TransactionType};
use crate::writer::{Commit, WriterHandle};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a single-account mutation
#[derive(Debug)]
pub struct Receipt {
    /// Transaction id of the log entry
    pub transaction_id: Uuid,
    /// Balance before the mutation
    pub previous_balance: Decimal,
    /// Balance after the mutation
    pub balance: Decimal,
    /// Durable-commit receipt
    pub commit: Commit,
}

/// Outcome of a transfer
#[derive(Debug)]
pub struct TransferReceipt {
    /// Transaction id of the PAY entry
    pub transaction_id: Uuid,
    /// Payer balance after the transfer
    pub from_balance: Decimal,
    /// Payee balance after the transfer
    pub to_balance: Decimal,
    /// Durable-commit receipt
    pub commit: Commit,
}

/// Parameters of a single-account credit or debit
struct Mutation<'a> {
    account: &'a AccountId,
    currency: &'a str,
    amount: Decimal,
    kind: TransactionType,
    actor: Option<AccountId>,
    banknote_id: Option<Uuid>,
}

/// The ledger engine
#[derive(Debug)]
pub struct LedgerEngine {
    pub(crate) cache: AccountCache,
    pub(crate) locks: LockTable,
    pub(crate) currencies: Arc<CurrencyRegistry>,
    pub(crate) policy: Arc<dyn BalancePolicy>,
    pub(crate) writer: WriterHandle,
    pub(crate) store: Arc<dyn Backend>,
    pub(crate) metrics: Metrics,
    pub(crate) start_balance: Decimal,
}

impl LedgerEngine {
    /// Create an engine over an empty working set
    pub fn new(
        store: Arc<dyn Backend>,
        writer: WriterHandle,
        currencies: Arc<CurrencyRegistry>,
        policy: Arc<dyn BalancePolicy>,
        metrics: Metrics,
        start_balance: Decimal,
    ) -> Self {
        Self {
            cache: AccountCache::new(),
            locks: LockTable::new(),
            currencies,
            policy,
            writer,
            store,
            metrics,
            start_balance,
        }
    }

    /// Currency registry
    pub fn currencies(&self) -> &CurrencyRegistry {
        &self.currencies
    }

    /// Balance policy
    pub fn policy(&self) -> &dyn BalancePolicy {
        self.policy.as_ref()
    }

    /// Whether the account is in the working set
    pub fn has_account(&self, id: &AccountId) -> bool {
        self.cache.contains(id)
    }

    /// Number of accounts in the working set
    pub fn cached_accounts(&self) -> usize {
        self.cache.len()
    }

    /// Cached balance, read under the account's read lock
    pub fn get_balance(&self, id: &AccountId, currency: &str) -> Result<Decimal> {
        self.ensure_loaded(id)?;
        let currency = self.currencies.resolve(currency)?;
        let lock = self.locks.lock_for(id);
        let _guard = lock.read();
        self.cache.balance(id, &currency).ok_or(Error::AccountNotLoaded(*id))
    }

    /// Copy of a cached account
    pub fn account(&self, id: &AccountId) -> Option<Account> {
        if !self.cache.contains(id) {
            return None;
        }
        let lock = self.locks.lock_for(id);
        let _guard = lock.read();
        self.cache.snapshot(id)
    }

    /// Add `amount` to a balance
    pub fn deposit(&self, id: &AccountId, currency: &str, amount: Decimal) -> Result<Receipt> {
        self.credit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Deposit,
            actor: None,
            banknote_id: None,
        })
    }

    /// Subtract `amount` from a balance, subject to the debt limit
    pub fn withdraw(&self, id: &AccountId, currency: &str, amount: Decimal) -> Result<Receipt> {
        self.debit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Withdraw,
            actor: None,
            banknote_id: None,
        })
    }

    /// Withdraw tagged with an external banknote reference
    pub fn withdraw_with_banknote(
        &self,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
        banknote_id: Uuid,
    ) -> Result<Receipt> {
        self.debit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Withdraw,
            actor: None,
            banknote_id: Some(banknote_id),
        })
    }

    /// Withdraw into a freshly issued banknote
    pub fn withdraw_banknote(
        &self,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<(Uuid, Receipt)> {
        let banknote_id = Uuid::new_v4();
        let receipt = self.withdraw_with_banknote(id, currency, amount, banknote_id)?;
        Ok((banknote_id, receipt))
    }

    /// Deposit redeeming a banknote
    pub(crate) fn deposit_banknote(
        &self,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
        banknote_id: Uuid,
    ) -> Result<Receipt> {
        self.credit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Deposit,
            actor: None,
            banknote_id: Some(banknote_id),
        })
    }

    /// Administrative credit
    pub fn give(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        self.credit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Give,
            actor,
            banknote_id: None,
        })
    }

    /// Administrative debit, subject to the debt limit
    pub fn take(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        self.debit(Mutation {
            account: id,
            currency,
            amount,
            kind: TransactionType::Take,
            actor,
            banknote_id: None,
        })
    }

    /// Replace a balance, recording the previous one
    pub fn set_balance(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        let result = self.try_set_balance(actor, id, currency, amount);
        self.observe(TransactionType::Set, id, currency, amount, &result);
        result
    }

    fn try_set_balance(
        &self,
        actor: Option<AccountId>,
        id: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Receipt> {
        if amount < Decimal::ZERO && !self.policy.allows_negative() {
            return Err(Error::InvalidAmount(amount));
        }
        self.ensure_loaded(id)?;
        let currency = self.currencies.resolve(currency)?;

        self.with_account_locked(id, || {
            let previous = self.cache.update(id, |account| {
                let previous = account.balance(&currency);
                account.set_balance(currency.clone(), amount);
                Ok(previous)
            })?;

            let mut record = LogRecord::new(TransactionType::Set, currency.clone(), amount)
                .with_sender(actor)
                .with_receiver(Some(*id));
            record.old_balance = Some(previous);
            let transaction_id = record.transaction_id;
            let commit = self.persist(&[(*id, currency.clone(), amount)], record);

            Ok(Receipt { transaction_id, previous_balance: previous, balance: amount, commit })
        })
    }

    /// Move `amount` from one account to another as a single PAY entry
    pub fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        let result = self.try_transfer(from, to, currency, amount);
        self.observe(TransactionType::Pay, from, currency, amount, &result);
        result
    }

    fn try_transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        ensure_positive(amount)?;
        if from == to {
            return Err(Error::SelfTransfer(*from));
        }
        self.ensure_loaded(from)?;
        self.ensure_loaded(to)?;
        let currency = self.currencies.resolve(currency)?;

        self.with_pair_locked(from, to, || {
            let from_balance = self.cache.update(from, |account| {
                let next = self.debited(from, &currency, account.balance(&currency), amount)?;
                account.set_balance(currency.clone(), next);
                Ok(next)
            })?;

            let to_balance = match self.cache.update(to, |account| {
                let next = self.credited(to, &currency, account.balance(&currency), amount)?;
                account.set_balance(currency.clone(), next);
                Ok(next)
            }) {
                Ok(balance) => balance,
                Err(err) => {
                    self.refund(from, &currency, amount, TransactionType::Pay)?;
                    return Err(err);
                }
            };

            let record = LogRecord::new(TransactionType::Pay, currency.clone(), amount)
                .with_sender(Some(*from))
                .with_receiver(Some(*to));
            let transaction_id = record.transaction_id;
            let commit = self.persist(
                &[(*from, currency.clone(), from_balance), (*to, currency.clone(), to_balance)],
                record,
            );

            Ok(TransferReceipt { transaction_id, from_balance, to_balance, commit })
        })
    }

    /// Apply a rollback compensation and queue its ROLLBACK entry. Accounts
    /// must be loaded; the entry's currency is used as recorded.
    pub(crate) fn apply_compensation(
        &self,
        plan: &Compensation,
        currency: &CurrencyId,
        amount: Decimal,
        mut record: LogRecord,
    ) -> Result<Commit> {
        match *plan {
            Compensation::Restore { account, balance } => {
                self.ensure_loaded(&account)?;
                self.with_account_locked(&account, || {
                    let previous = self.cache.update(&account, |acc| {
                        let previous = acc.balance(currency);
                        acc.set_balance(currency.clone(), balance);
                        Ok(previous)
                    })?;
                    record.old_balance = Some(previous);
                    Ok(self.persist(&[(account, currency.clone(), balance)], record))
                })
            }
            Compensation::Move { debit, credit } => {
                for id in debit.iter().chain(credit.iter()) {
                    self.ensure_loaded(id)?;
                }
                let apply = || -> Result<Commit> {
                    let mut rows = Vec::with_capacity(2);
                    if let Some(id) = debit {
                        let next = self.cache.update(&id, |acc| {
                            let next = self.debited(&id, currency, acc.balance(currency), amount)?;
                            acc.set_balance(currency.clone(), next);
                            Ok(next)
                        })?;
                        rows.push((id, currency.clone(), next));
                    }
                    if let Some(id) = credit {
                        let credited = self.cache.update(&id, |acc| {
                            let next = self.credited(&id, currency, acc.balance(currency), amount)?;
                            acc.set_balance(currency.clone(), next);
                            Ok(next)
                        });
                        match credited {
                            Ok(next) => rows.push((id, currency.clone(), next)),
                            Err(err) => {
                                if let Some(debited) = debit {
                                    self.refund(&debited, currency, amount, TransactionType::Rollback)?;
                                }
                                return Err(err);
                            }
                        }
                    }
                    Ok(self.persist(&rows, record))
                };

                match (debit, credit) {
                    (Some(a), Some(b)) if a != b => self.with_pair_locked(&a, &b, apply),
                    (Some(id), _) | (None, Some(id)) => self.with_account_locked(&id, apply),
                    (None, None) => apply(),
                }
            }
        }
    }

    fn credit(&self, m: Mutation<'_>) -> Result<Receipt> {
        let result = self.apply_single(&m, true);
        self.observe(m.kind, m.account, m.currency, m.amount, &result);
        result
    }

    fn debit(&self, m: Mutation<'_>) -> Result<Receipt> {
        let result = self.apply_single(&m, false);
        self.observe(m.kind, m.account, m.currency, m.amount, &result);
        result
    }

    fn apply_single(&self, m: &Mutation<'_>, credit: bool) -> Result<Receipt> {
        ensure_positive(m.amount)?;
        self.ensure_loaded(m.account)?;
        let currency = self.currencies.resolve(m.currency)?;
        let id = m.account;

        self.with_account_locked(id, || {
            let (previous, balance) = self.cache.update(id, |account| {
                let previous = account.balance(&currency);
                let next = if credit {
                    self.credited(id, &currency, previous, m.amount)?
                } else {
                    self.debited(id, &currency, previous, m.amount)?
                };
                account.set_balance(currency.clone(), next);
                Ok((previous, next))
            })?;

            let mut record = LogRecord::new(m.kind, currency.clone(), m.amount)
                .with_sender(m.actor)
                .with_receiver(Some(*id));
            record.banknote_id = m.banknote_id;
            let transaction_id = record.transaction_id;
            let commit = self.persist(&[(*id, currency.clone(), balance)], record);

            Ok(Receipt { transaction_id, previous_balance: previous, balance, commit })
        })
    }

    /// Balance after debiting, or the shortfall against the policy floor
    fn debited(
        &self,
        id: &AccountId,
        currency: &CurrencyId,
        balance: Decimal,
        amount: Decimal,
    ) -> Result<Decimal> {
        let next = balance - amount;
        if next >= Decimal::ZERO {
            return Ok(next);
        }

        let debt_limit = self.policy.allows_negative().then(|| self.policy.debt_limit(id));
        let floor = -debt_limit.unwrap_or(Decimal::ZERO);
        if next >= floor {
            return Ok(next);
        }

        Err(Error::InsufficientFunds {
            account: *id,
            currency: currency.clone(),
            balance,
            requested: amount,
            shortfall: floor - next,
            debt_limit,
        })
    }

    /// Balance after crediting, or the cap it would break
    fn credited(
        &self,
        id: &AccountId,
        currency: &CurrencyId,
        balance: Decimal,
        amount: Decimal,
    ) -> Result<Decimal> {
        let next = balance + amount;
        match self.policy.max_balance(id) {
            Some(max_balance) if next > max_balance => Err(Error::BalanceCapExceeded {
                account: *id,
                currency: currency.clone(),
                max_balance,
                attempted: next,
            }),
            _ => Ok(next),
        }
    }

    /// Compensating deposit after a failed credit. Caller holds the lock.
    fn refund(
        &self,
        id: &AccountId,
        currency: &CurrencyId,
        amount: Decimal,
        operation: TransactionType,
    ) -> Result<()> {
        let refunded = self.cache.update(id, |account| {
            let next = self.credited(id, currency, account.balance(currency), amount)?;
            account.set_balance(currency.clone(), next);
            Ok(next)
        });

        match refunded {
            Ok(balance) => {
                tracing::debug!(
                    account = %id,
                    currency = %currency,
                    amount = %amount,
                    balance = %balance,
                    operation = operation.as_str(),
                    "Debit compensated after failed credit"
                );
                Ok(())
            }
            Err(err) => {
                let balance = self.cache.balance(id, currency);
                tracing::error!(
                    account = %id,
                    currency = %currency,
                    amount = %amount,
                    balance = ?balance,
                    operation = operation.as_str(),
                    error = %err,
                    "Compensating deposit failed, manual reconciliation required"
                );
                // Keep the durable row in step with the cache it now disagrees with
                if let Some(balance) = balance {
                    self.writer.submit_detached(WriteOp::SetBalance {
                        account: *id,
                        currency: currency.clone(),
                        balance,
                    });
                }
                Err(Error::Integrity(format!(
                    "{} debited {} {} from {} but could not refund it: {}",
                    operation, amount, currency, id, err
                )))
            }
        }
    }

    /// Queue balance rows and a log record; call while holding the locks
    fn persist(&self, rows: &[(AccountId, CurrencyId, Decimal)], record: LogRecord) -> Commit {
        let mut commit = Commit::default();
        for (account, currency, balance) in rows {
            commit.push(self.writer.submit(WriteOp::SetBalance {
                account: *account,
                currency: currency.clone(),
                balance: *balance,
            }));
        }
        commit.push(self.writer.submit(WriteOp::AppendLog(record)));
        commit
    }

    pub(crate) fn ensure_loaded(&self, id: &AccountId) -> Result<()> {
        if self.cache.contains(id) {
            Ok(())
        } else {
            Err(Error::AccountNotLoaded(*id))
        }
    }

    /// Run `f` under the account's write lock, tearing the lock down again
    /// if the account turned out to be gone.
    fn with_account_locked<R>(&self, id: &AccountId, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let lock = self.locks.lock_for(id);
        let result = {
            let _guard = lock.write();
            f()
        };
        if let Err(Error::AccountNotLoaded(missing)) = &result {
            let missing = *missing;
            drop(lock);
            self.locks.release(&missing);
        }
        result
    }

    /// Run `f` under both accounts' write locks, taken in id order
    fn with_pair_locked<R>(
        &self,
        a: &AccountId,
        b: &AccountId,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let [(_, first), (_, second)] = self.locks.ordered_pair(a, b);
        let result = {
            let _first = first.write();
            let _second = second.write();
            f()
        };
        if let Err(Error::AccountNotLoaded(missing)) = &result {
            let missing = *missing;
            drop(first);
            drop(second);
            self.locks.release(&missing);
        }
        result
    }

    fn observe<T>(
        &self,
        kind: TransactionType,
        account: &AccountId,
        currency: &str,
        amount: Decimal,
        result: &Result<T>,
    ) {
        match result {
            Ok(_) => {
                self.metrics.record_mutation(kind.as_str());
                tracing::trace!(
                    operation = kind.as_str(),
                    account = %account,
                    currency,
                    amount = %amount,
                    "Mutation applied"
                );
            }
            Err(e) if e.is_rejection() => {
                self.metrics.record_rejection(e.reason());
                tracing::debug!(
                    operation = kind.as_str(),
                    account = %account,
                    currency,
                    amount = %amount,
                    reason = e.reason(),
                    "Mutation rejected"
                );
            }
            Err(e) => tracing::error!(
                operation = kind.as_str(),
                account = %account,
                currency,
                amount = %amount,
                error = %e,
                "Mutation failed"
            ),
        }
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        Err(Error::InvalidAmount(amount))
    } else {
        Ok(())
    }
}
