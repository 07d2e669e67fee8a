//! Error types for the ledger

use crate::types::{AccountId, CurrencyId};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount was zero, negative or otherwise unusable for the operation
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Currency id is not present in the registry
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    /// Account is not in the working set; load it first
    #[error("Account not loaded: {0}")]
    AccountNotLoaded(AccountId),

    /// Withdraw would push the balance below what the policy permits
    #[error(
        "Insufficient funds for {account} in {currency}: balance {balance}, requested {requested}, short by {shortfall}{}",
        debt_limit_suffix(.debt_limit)
    )]
    InsufficientFunds {
        /// Debited account
        account: AccountId,
        /// Currency of the debit
        currency: CurrencyId,
        /// Balance before the attempt
        balance: Decimal,
        /// Requested amount
        requested: Decimal,
        /// How much more would have been needed
        shortfall: Decimal,
        /// Debt limit in effect, if negative balances are permitted
        debt_limit: Option<Decimal>,
    },

    /// Credit would push the balance above the account's cap
    #[error("Balance cap exceeded for {account} in {currency}: {attempted} > {max_balance}")]
    BalanceCapExceeded {
        /// Credited account
        account: AccountId,
        /// Currency of the credit
        currency: CurrencyId,
        /// Cap in effect
        max_balance: Decimal,
        /// Balance the credit would have produced
        attempted: Decimal,
    },

    /// Transfer where payer and payee are the same account
    #[error("Cannot transfer to the same account: {0}")]
    SelfTransfer(AccountId),

    /// Transaction was already rolled back
    #[error("Transaction already reverted: {0}")]
    AlreadyReverted(Uuid),

    /// Banknote was already redeemed
    #[error("Banknote already redeemed: {0}")]
    AlreadyRedeemed(Uuid),

    /// Log entry has no compensating mutation
    #[error("Transaction cannot be reverted: {0}")]
    Irreversible(String),

    /// Transaction, account or banknote not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A compensating mutation failed; balances need manual reconciliation
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// Concurrency error (writer mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn debt_limit_suffix(limit: &Option<Decimal>) -> String {
    match limit {
        Some(limit) => format!(" (debt limit {})", limit),
        None => String::new(),
    }
}

impl Error {
    /// Stable label for the error kind, used as a metrics label and by
    /// front ends to select a localized message.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidAmount(_) => "invalid_amount",
            Error::UnknownCurrency(_) => "unknown_currency",
            Error::AccountNotLoaded(_) => "account_not_loaded",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::BalanceCapExceeded { .. } => "balance_cap_exceeded",
            Error::SelfTransfer(_) => "self_transfer",
            Error::AlreadyReverted(_) => "already_reverted",
            Error::AlreadyRedeemed(_) => "already_redeemed",
            Error::Irreversible(_) => "irreversible",
            Error::NotFound(_) => "not_found",
            Error::Storage(_) => "storage",
            Error::Integrity(_) => "integrity",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    /// Whether the error was raised by validation, before any state changed
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount(_)
                | Error::UnknownCurrency(_)
                | Error::AccountNotLoaded(_)
                | Error::InsufficientFunds { .. }
                | Error::BalanceCapExceeded { .. }
                | Error::SelfTransfer(_)
                | Error::AlreadyReverted(_)
                | Error::AlreadyRedeemed(_)
                | Error::Irreversible(_)
                | Error::NotFound(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("Migration failed: {}", err))
    }
}

impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::Storage(format!("Corrupt decimal value: {}", err))
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::Storage(format!("Corrupt identifier: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_states_shortfall() {
        let err = Error::InsufficientFunds {
            account: AccountId::from(Uuid::nil()),
            currency: CurrencyId::new("dollar"),
            balance: Decimal::new(1000, 0),
            requested: Decimal::new(1500, 0),
            shortfall: Decimal::new(500, 0),
            debt_limit: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("short by 500"));
        assert!(!msg.contains("debt limit"));
        assert_eq!(err.reason(), "insufficient_funds");
        assert!(err.is_rejection());
    }

    #[test]
    fn test_debt_limit_in_message() {
        let err = Error::InsufficientFunds {
            account: AccountId::from(Uuid::nil()),
            currency: CurrencyId::new("dollar"),
            balance: Decimal::ZERO,
            requested: Decimal::new(150, 0),
            shortfall: Decimal::new(50, 0),
            debt_limit: Some(Decimal::new(100, 0)),
        };
        assert!(err.to_string().contains("(debt limit 100)"));
    }

    #[test]
    fn test_storage_errors_are_not_rejections() {
        assert!(!Error::Storage("disk full".into()).is_rejection());
        assert_eq!(Error::Integrity("x".into()).reason(), "integrity");
    }
}
