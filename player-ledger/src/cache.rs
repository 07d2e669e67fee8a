//! Account cache: the in-memory working set
//!
//! Holds every active account keyed by id. Entries are mutated only by the
//! engine while it holds the account's write lock from [`crate::locks::LockTable`];
//! the map's own shard locking just keeps the structure itself consistent.
//!
//! An account loaded only for an offline operation (a rollback) carries a
//! hold count instead of a session. The last holder to let go evicts it,
//! unless the player joined in the meantime, which clears the holds.

use crate::types::{Account, AccountId, CurrencyId};
use crate::{Error, Result};
use dashmap::DashMap;
use rust_decimal::Decimal;

/// Concurrent map of active accounts
#[derive(Debug, Default)]
pub struct AccountCache {
    accounts: DashMap<AccountId, Account>,
    holds: DashMap<AccountId, usize>,
}

impl AccountCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the account is loaded
    pub fn contains(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    /// Number of loaded accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account is loaded
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Copy of a loaded account
    pub fn snapshot(&self, id: &AccountId) -> Option<Account> {
        self.accounts.get(id).map(|account| account.clone())
    }

    /// Balance of a loaded account
    pub fn balance(&self, id: &AccountId, currency: &CurrencyId) -> Option<Decimal> {
        self.accounts.get(id).map(|account| account.balance(currency))
    }

    /// Insert unless already present; returns the cached account either way
    pub fn insert_if_absent(&self, account: Account) -> (Account, bool) {
        let mut inserted = false;
        let cached = self
            .accounts
            .entry(account.id)
            .or_insert_with(|| {
                inserted = true;
                account
            })
            .clone();
        (cached, inserted)
    }

    /// Run `f` against a loaded account. `f` must leave the account untouched
    /// when it returns an error.
    pub fn update<R>(&self, id: &AccountId, f: impl FnOnce(&mut Account) -> Result<R>) -> Result<R> {
        let mut account = self.accounts.get_mut(id).ok_or(Error::AccountNotLoaded(*id))?;
        f(account.value_mut())
    }

    /// Remove an account, returning its final state
    pub fn remove(&self, id: &AccountId) -> Option<Account> {
        self.holds.remove(id);
        self.accounts.remove(id).map(|(_, account)| account)
    }

    /// Add a transient hold on an account that has no session
    pub fn hold(&self, id: &AccountId) {
        *self.holds.entry(*id).or_insert(0) += 1;
    }

    /// Whether the account is cached only on behalf of holders
    pub fn is_held(&self, id: &AccountId) -> bool {
        self.holds.contains_key(id)
    }

    /// Drop one hold; returns true if it was the last one
    pub fn release_hold(&self, id: &AccountId) -> bool {
        let last = match self.holds.get_mut(id) {
            Some(mut count) => {
                *count -= 1;
                *count == 0
            }
            None => return false,
        };
        if last {
            self.holds.remove_if(id, |_, count| *count == 0);
        }
        last
    }

    /// Hand a held account over to a session; outstanding holds become no-ops
    pub fn promote(&self, id: &AccountId) -> bool {
        self.holds.remove(id).is_some()
    }

    /// Ids of every loaded account
    pub fn ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let cache = AccountCache::new();
        let id = AccountId::new_v4();
        let dollar = CurrencyId::new("dollar");

        let mut first = Account::new(id, "Alex");
        first.set_balance(dollar.clone(), Decimal::new(10, 0));
        let (_, inserted) = cache.insert_if_absent(first);
        assert!(inserted);

        let (cached, inserted) = cache.insert_if_absent(Account::new(id, "Stale"));
        assert!(!inserted);
        assert_eq!(cached.display_name, "Alex");
        assert_eq!(cache.balance(&id, &dollar), Some(Decimal::new(10, 0)));
    }

    #[test]
    fn test_update_missing_account() {
        let cache = AccountCache::new();
        let id = AccountId::new_v4();
        let result = cache.update(&id, |_| Ok(()));
        assert!(matches!(result, Err(Error::AccountNotLoaded(missing)) if missing == id));
    }

    #[test]
    fn test_holds_count_down_and_promote() {
        let cache = AccountCache::new();
        let id = AccountId::new_v4();
        cache.insert_if_absent(Account::new(id, "Alex"));

        cache.hold(&id);
        cache.hold(&id);
        assert!(cache.is_held(&id));
        assert!(!cache.release_hold(&id));
        assert!(cache.release_hold(&id));
        assert!(!cache.is_held(&id));

        cache.hold(&id);
        assert!(cache.promote(&id));
        assert!(!cache.release_hold(&id));
        assert!(cache.contains(&id));
    }

    #[test]
    fn test_remove_returns_final_state() {
        let cache = AccountCache::new();
        let id = AccountId::new_v4();
        cache.insert_if_absent(Account::new(id, "Alex"));
        cache
            .update(&id, |account| {
                account.set_balance(CurrencyId::new("gems"), Decimal::ONE);
                Ok(())
            })
            .unwrap();

        let removed = cache.remove(&id).unwrap();
        assert_eq!(removed.balance(&CurrencyId::new("gems")), Decimal::ONE);
        assert!(cache.is_empty());
    }
}
