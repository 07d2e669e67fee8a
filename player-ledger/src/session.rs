//! Account working-set lifecycle
//!
//! Accounts enter the cache on join (`load_or_create`) or when an offline
//! account is needed for a rollback (`attach`), and leave it on `evict` or
//! when the last `detach` lets go of an account nobody joined with.
//! Loads wait on a writer flush first, so a save queued by an earlier
//! eviction is visible before the account is read back. Evictions queue the
//! final save before the cache entry disappears, so any flush issued after
//! the entry is gone is ordered behind that save.

use crate::engine::LedgerEngine;
use crate::storage::{AccountStore, WriteOp};
use crate::types::{Account, AccountId};
use crate::writer::Commit;
use crate::{Error, Result};

impl LedgerEngine {
    /// Bring an account into the working set, creating it with the start
    /// balance in the default currency if the store has never seen it.
    /// The display name is recorded either way.
    pub async fn load_or_create(&self, id: AccountId, display_name: &str) -> Result<Account> {
        if let Some(account) = self.rename_cached(&id, display_name)? {
            return Ok(account);
        }

        self.writer.flush().await?;
        let (account, created) = match self.store.load(&id).await? {
            Some(mut stored) => {
                stored.display_name = display_name.to_string();
                (stored, false)
            }
            None => {
                let mut fresh = Account::new(id, display_name);
                fresh.set_balance(self.currencies.default_id(), self.start_balance);
                (fresh, true)
            }
        };

        let lock = self.locks.lock_for(&id);
        let (cached, inserted) = {
            let _guard = lock.write();
            let (cached, inserted) = self.cache.insert_if_absent(account);
            if !inserted && self.cache.promote(&id) {
                tracing::debug!(account = %id, "Attached account joined by its player");
            }
            if inserted && created {
                self.writer.submit_detached(WriteOp::SaveAccount(cached.clone()));
            } else if inserted {
                self.writer.submit_detached(WriteOp::UpdateName {
                    account: id,
                    display_name: cached.display_name.clone(),
                });
            }
            (cached, inserted)
        };

        if inserted {
            self.metrics.set_cached_accounts(self.cache.len());
            tracing::info!(account = %id, created, "Account loaded");
        }
        Ok(cached)
    }

    /// Bring an existing account into the working set without creating it,
    /// for work done on the player's behalf while they are offline.
    ///
    /// Returns `true` if the caller now holds the account and must hand it
    /// back with [`detach`](Self::detach), or `false` if a session already
    /// owns it.
    pub async fn attach(&self, id: &AccountId) -> Result<bool> {
        if let Some(held) = self.hold_cached(id) {
            return Ok(held);
        }

        self.writer.flush().await?;
        let account = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        let lock = self.locks.lock_for(id);
        let (inserted, held) = {
            let _guard = lock.write();
            let inserted = self.cache.insert_if_absent(account).1;
            let held = inserted || self.cache.is_held(id);
            if held {
                self.cache.hold(id);
            }
            (inserted, held)
        };
        if inserted {
            self.metrics.set_cached_accounts(self.cache.len());
            tracing::debug!(account = %id, "Account attached");
        }
        Ok(held)
    }

    /// Give back a hold taken by [`attach`](Self::attach). The last holder
    /// evicts the account unless its player has joined since.
    pub async fn detach(&self, id: &AccountId) -> Result<()> {
        let lock = self.locks.lock_for(id);
        let saved = {
            let _guard = lock.write();
            if self.cache.release_hold(id) {
                self.save_and_remove(id)
            } else {
                None
            }
        };
        drop(lock);

        let commit = match saved {
            Some(commit) => commit,
            None => {
                if !self.cache.contains(id) {
                    self.locks.release(id);
                }
                return Ok(());
            }
        };
        self.locks.release(id);
        self.metrics.set_cached_accounts(self.cache.len());
        commit.wait().await?;

        tracing::debug!(account = %id, "Attached account released");
        Ok(())
    }

    /// Persist the final state of an account, then drop it and its lock.
    /// Returns once the final save is durable.
    pub async fn evict(&self, id: &AccountId) -> Result<()> {
        if !self.cache.contains(id) {
            return Err(Error::AccountNotLoaded(*id));
        }

        let lock = self.locks.lock_for(id);
        let saved = {
            let _guard = lock.write();
            self.save_and_remove(id)
        };
        drop(lock);
        self.locks.release(id);

        let commit = saved.ok_or(Error::AccountNotLoaded(*id))?;
        self.metrics.set_cached_accounts(self.cache.len());
        commit.wait().await?;

        tracing::info!(account = %id, "Account evicted");
        Ok(())
    }

    /// Evict every cached account. All evictions are attempted; the first
    /// failure is returned.
    pub async fn evict_all(&self) -> Result<usize> {
        let mut evicted = 0;
        let mut first_error = None;

        for id in self.cache.ids() {
            match self.evict(&id).await {
                Ok(()) => evicted += 1,
                Err(Error::AccountNotLoaded(_)) => {}
                Err(e) => {
                    tracing::error!(account = %id, error = %e, "Eviction failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    /// Resolve a display name, case-insensitively, to an account id
    pub async fn find_account(&self, display_name: &str) -> Result<Option<AccountId>> {
        self.writer.flush().await?;
        self.store.find_by_name(display_name).await
    }

    /// Queue the final save, then drop the cache entry. Caller holds the
    /// account's write lock.
    fn save_and_remove(&self, id: &AccountId) -> Option<Commit> {
        let snapshot = self.cache.snapshot(id)?;
        let mut commit = Commit::default();
        commit.push(self.writer.submit(WriteOp::SaveAccount(snapshot)));
        self.cache.remove(id);
        Some(commit)
    }

    /// Take a hold on an already cached account. `None` if it is not cached.
    fn hold_cached(&self, id: &AccountId) -> Option<bool> {
        if !self.cache.contains(id) {
            return None;
        }

        let lock = self.locks.lock_for(id);
        let _guard = lock.write();
        if !self.cache.contains(id) {
            return None;
        }
        let held = self.cache.is_held(id);
        if held {
            self.cache.hold(id);
        }
        Some(held)
    }

    fn rename_cached(&self, id: &AccountId, display_name: &str) -> Result<Option<Account>> {
        if !self.cache.contains(id) {
            return Ok(None);
        }

        let lock = self.locks.lock_for(id);
        let _guard = lock.write();
        if self.cache.promote(id) {
            tracing::debug!(account = %id, "Attached account joined by its player");
        }
        let renamed = self.cache.update(id, |account| {
            let changed = account.display_name != display_name;
            if changed {
                account.display_name = display_name.to_string();
            }
            Ok((account.clone(), changed))
        });

        match renamed {
            Ok((account, changed)) => {
                if changed {
                    self.writer.submit_detached(WriteOp::UpdateName {
                        account: *id,
                        display_name: display_name.to_string(),
                    });
                }
                Ok(Some(account))
            }
            // Evicted between the check and the lock
            Err(Error::AccountNotLoaded(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EconomyConfig, WriteBehindConfig};
    use crate::currency::{Currency, CurrencyRegistry};
    use crate::engine::LedgerEngine;
    use crate::metrics::Metrics;
    use crate::policy::ConfiguredPolicy;
    use crate::storage::{AccountStore, MemoryStore};
    use crate::types::{AccountId, CurrencyId};
    use crate::writer::spawn_writer;
    use crate::Error;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn engine(store: Arc<MemoryStore>) -> LedgerEngine {
        let metrics = Metrics::new().unwrap();
        let writer = spawn_writer(store.clone(), &WriteBehindConfig::default(), metrics.clone());
        let economy = EconomyConfig::default();
        LedgerEngine::new(
            store,
            writer,
            Arc::new(CurrencyRegistry::new(vec![Currency::dollar()]).unwrap()),
            Arc::new(ConfiguredPolicy::new(&economy)),
            metrics,
            economy.start_balance,
        )
    }

    #[tokio::test]
    async fn test_new_account_gets_start_balance() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let id = AccountId::new_v4();

        let account = engine.load_or_create(id, "Alex").await.unwrap();
        assert_eq!(account.balance(&CurrencyId::new("dollar")), Decimal::new(1000, 0));
        assert!(engine.has_account(&id));

        engine.writer.flush().await.unwrap();
        assert_eq!(store.find_by_name("alex").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_evict_then_reload_sees_final_state() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let id = AccountId::new_v4();

        engine.load_or_create(id, "Alex").await.unwrap();
        engine.deposit(&id, "dollar", Decimal::new(5, 0)).unwrap();
        engine.evict(&id).await.unwrap();

        assert!(!engine.has_account(&id));
        assert!(engine.locks.is_empty());
        assert!(matches!(
            engine.deposit(&id, "dollar", Decimal::ONE),
            Err(Error::AccountNotLoaded(_))
        ));

        let account = engine.load_or_create(id, "Alexandra").await.unwrap();
        assert_eq!(account.balance(&CurrencyId::new("dollar")), Decimal::new(1005, 0));
        assert_eq!(account.display_name, "Alexandra");
    }

    #[tokio::test]
    async fn test_attach_requires_existing_account() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let id = AccountId::new_v4();

        assert!(matches!(engine.attach(&id).await, Err(Error::NotFound(_))));

        engine.load_or_create(id, "Alex").await.unwrap();
        assert!(!engine.attach(&id).await.unwrap());
        engine.evict(&id).await.unwrap();

        // Two holders; the account leaves with the last one
        assert!(engine.attach(&id).await.unwrap());
        assert!(engine.attach(&id).await.unwrap());
        engine.detach(&id).await.unwrap();
        assert!(engine.has_account(&id));
        engine.detach(&id).await.unwrap();
        assert!(!engine.has_account(&id));
        assert!(engine.locks.is_empty());
    }

    #[tokio::test]
    async fn test_join_keeps_attached_account_cached() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let id = AccountId::new_v4();
        engine.load_or_create(id, "Alex").await.unwrap();
        engine.evict(&id).await.unwrap();

        assert!(engine.attach(&id).await.unwrap());
        engine.load_or_create(id, "Alex").await.unwrap();
        engine.detach(&id).await.unwrap();

        assert!(engine.has_account(&id));
        engine.deposit(&id, "dollar", Decimal::ONE).unwrap();
        assert_eq!(engine.get_balance(&id, "dollar").unwrap(), Decimal::new(1001, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_racing_eviction_sees_final_save() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(engine(store.clone()));
        let dollar = CurrencyId::new("dollar");

        for round in 0..50 {
            let id = AccountId::new_v4();
            engine.load_or_create(id, "Alex").await.unwrap();
            engine.deposit(&id, "dollar", Decimal::new(round + 1, 0)).unwrap();

            let evicting = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.evict(&id).await })
            };
            let reloaded = engine.load_or_create(id, "Alex").await.unwrap();
            let _ = evicting.await.unwrap();

            let expected = Decimal::new(1000 + round + 1, 0);
            assert_eq!(reloaded.balance(&dollar), expected);
            if engine.has_account(&id) {
                assert_eq!(engine.get_balance(&id, "dollar").unwrap(), expected);
            }
            engine.writer.flush().await.unwrap();
            assert_eq!(store.balance(&id, &dollar).await.unwrap(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_evict_all_and_missing() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store);

        for name in ["a", "b", "c"] {
            engine.load_or_create(AccountId::new_v4(), name).await.unwrap();
        }
        assert!(matches!(
            engine.evict(&AccountId::new_v4()).await,
            Err(Error::AccountNotLoaded(_))
        ));
        assert_eq!(engine.evict_all().await.unwrap(), 3);
        assert_eq!(engine.cached_accounts(), 0);
    }
}
