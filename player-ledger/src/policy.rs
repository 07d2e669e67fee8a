//! Per-account balance policy
//!
//! The engine asks a [`BalancePolicy`] how far below zero an account may go
//! and how high it may climb. [`ConfiguredPolicy`] serves the global
//! defaults from [`EconomyConfig`] and lets a permission system override
//! them per account.

use crate::config::EconomyConfig;
use crate::types::AccountId;
use dashmap::DashMap;
use rust_decimal::Decimal;

/// Source of debt limits and balance caps
pub trait BalancePolicy: Send + Sync + std::fmt::Debug {
    /// Whether balances may go below zero at all
    fn allows_negative(&self) -> bool;

    /// Maximum magnitude of a negative balance for the account
    fn debt_limit(&self, account: &AccountId) -> Decimal;

    /// Highest balance the account may hold, if capped
    fn max_balance(&self, account: &AccountId) -> Option<Decimal>;
}

/// Policy backed by configuration plus per-account overrides
#[derive(Debug, Default)]
pub struct ConfiguredPolicy {
    allow_negative: bool,
    default_debt_limit: Decimal,
    default_max_balance: Option<Decimal>,
    debt_limits: DashMap<AccountId, Decimal>,
    max_balances: DashMap<AccountId, Option<Decimal>>,
}

impl ConfiguredPolicy {
    /// Policy with the configured defaults and no overrides
    pub fn new(config: &EconomyConfig) -> Self {
        Self {
            allow_negative: config.allow_negative_balance,
            default_debt_limit: config.default_debt_limit,
            default_max_balance: config.max_balance,
            debt_limits: DashMap::new(),
            max_balances: DashMap::new(),
        }
    }

    /// Override the debt limit for one account
    pub fn set_debt_limit(&self, account: AccountId, limit: Decimal) {
        self.debt_limits.insert(account, limit.abs());
    }

    /// Override the balance cap for one account (`None` = uncapped)
    pub fn set_max_balance(&self, account: AccountId, max: Option<Decimal>) {
        self.max_balances.insert(account, max);
    }

    /// Drop both overrides for an account
    pub fn clear(&self, account: &AccountId) {
        self.debt_limits.remove(account);
        self.max_balances.remove(account);
    }
}

impl BalancePolicy for ConfiguredPolicy {
    fn allows_negative(&self) -> bool {
        self.allow_negative
    }

    fn debt_limit(&self, account: &AccountId) -> Decimal {
        self.debt_limits
            .get(account)
            .map(|limit| *limit)
            .unwrap_or(self.default_debt_limit)
    }

    fn max_balance(&self, account: &AccountId) -> Option<Decimal> {
        self.max_balances
            .get(account)
            .map(|max| *max)
            .unwrap_or(self.default_max_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = EconomyConfig {
            allow_negative_balance: true,
            default_debt_limit: Decimal::new(100, 0),
            max_balance: Some(Decimal::new(1_000_000, 0)),
            ..EconomyConfig::default()
        };
        let policy = ConfiguredPolicy::new(&config);
        let vip = AccountId::new_v4();
        let regular = AccountId::new_v4();

        policy.set_debt_limit(vip, Decimal::new(-500, 0));
        policy.set_max_balance(vip, None);

        assert!(policy.allows_negative());
        assert_eq!(policy.debt_limit(&vip), Decimal::new(500, 0));
        assert_eq!(policy.debt_limit(&regular), Decimal::new(100, 0));
        assert_eq!(policy.max_balance(&vip), None);
        assert_eq!(policy.max_balance(&regular), Some(Decimal::new(1_000_000, 0)));

        policy.clear(&vip);
        assert_eq!(policy.debt_limit(&vip), Decimal::new(100, 0));
    }
}
