//! Lock table: one reader/writer lock per active account
//!
//! Locks are created lazily on first use and torn down when the account is
//! evicted. A lock is only removed when nobody else holds a handle to it, so
//! two callers can never end up with different locks for the same id.

use crate::types::AccountId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared handle to an account lock
pub type AccountLock = Arc<RwLock<()>>;

/// Map of account id to lock
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<AccountId, AccountLock>,
}

impl LockTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for the account, creating it if needed
    pub fn lock_for(&self, id: &AccountId) -> AccountLock {
        self.locks.entry(*id).or_default().clone()
    }

    /// Locks for two distinct accounts, in global acquisition order
    pub fn ordered_pair(&self, a: &AccountId, b: &AccountId) -> [(AccountId, AccountLock); 2] {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        [(*first, self.lock_for(first)), (*second, self.lock_for(second))]
    }

    /// Drop the lock entry unless another caller still holds a handle.
    /// Callers must release their own handle first.
    pub fn release(&self, id: &AccountId) -> bool {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Number of live lock entries
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_lock_for_same_id() {
        let table = LockTable::new();
        let id = AccountId::new_v4();
        let a = table.lock_for(&id);
        let b = table.lock_for(&id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_waits_for_holders() {
        let table = LockTable::new();
        let id = AccountId::new_v4();
        let held = table.lock_for(&id);

        assert!(!table.release(&id));
        assert_eq!(table.len(), 1);

        drop(held);
        assert!(table.release(&id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_pair_order_is_stable() {
        let table = LockTable::new();
        let a = AccountId::new_v4();
        let b = AccountId::new_v4();
        let forward = table.ordered_pair(&a, &b);
        let backward = table.ordered_pair(&b, &a);
        assert_eq!(forward[0].0, backward[0].0);
        assert!(forward[0].0 < forward[1].0);
    }
}
