//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Cheap cloning of identifiers
//! - Serde round trips for bulk dumps

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Account identifier (player UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Random account ID
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currency identifier, normalized to trimmed lower case
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CurrencyId(String);

impl CurrencyId {
    /// Normalize and wrap a currency id
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CurrencyId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for CurrencyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<CurrencyId> for String {
    fn from(id: CurrencyId) -> Self {
        id.0
    }
}

impl fmt::Display for CurrencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An account holding one balance per currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Last known display name
    pub display_name: String,

    /// Balances by currency; absent means zero
    pub balances: BTreeMap<CurrencyId, Decimal>,
}

impl Account {
    /// Create an account with no balances
    pub fn new(id: AccountId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            balances: BTreeMap::new(),
        }
    }

    /// Balance for a currency (zero if never touched)
    pub fn balance(&self, currency: &CurrencyId) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }

    /// Replace a currency balance, creating the entry lazily
    pub fn set_balance(&mut self, currency: CurrencyId, amount: Decimal) {
        self.balances.insert(currency, amount);
    }
}

/// Kind of ledger mutation recorded in the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Player-to-player payment
    Pay,
    /// Withdraw, optionally into a banknote
    Withdraw,
    /// Deposit, including banknote redemption
    Deposit,
    /// Administrative credit
    Give,
    /// Administrative debit
    Take,
    /// Administrative balance override
    Set,
    /// Compensation for an earlier entry
    Rollback,
}

impl TransactionType {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Pay => "PAY",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Give => "GIVE",
            TransactionType::Take => "TAKE",
            TransactionType::Set => "SET",
            TransactionType::Rollback => "ROLLBACK",
        }
    }

    /// Whether this kind falls in the given category
    pub fn in_category(&self, category: LogCategory) -> bool {
        match category {
            LogCategory::All => true,
            LogCategory::Trade => matches!(
                self,
                TransactionType::Pay | TransactionType::Withdraw | TransactionType::Deposit
            ),
            LogCategory::Admin => matches!(
                self,
                TransactionType::Give | TransactionType::Take | TransactionType::Set
            ),
        }
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PAY" => Ok(TransactionType::Pay),
            "WITHDRAW" => Ok(TransactionType::Withdraw),
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "GIVE" => Ok(TransactionType::Give),
            "TAKE" => Ok(TransactionType::Take),
            "SET" => Ok(TransactionType::Set),
            "ROLLBACK" => Ok(TransactionType::Rollback),
            other => Err(Error::Storage(format!("Unknown transaction type: {}", other))),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter for bulk log queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    /// Every reversible kind
    #[default]
    All,
    /// PAY, WITHDRAW and DEPOSIT
    Trade,
    /// GIVE, TAKE and SET
    Admin,
}

impl FromStr for LogCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(LogCategory::All),
            "trade" => Ok(LogCategory::Trade),
            "admin" => Ok(LogCategory::Admin),
            other => Err(Error::Config(format!("Unknown log category: {}", other))),
        }
    }
}

/// A log entry about to be appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Transaction ID (UUIDv7, time-ordered)
    pub transaction_id: Uuid,

    /// External reference for withdraw/redeem flows
    pub banknote_id: Option<Uuid>,

    /// When the mutation was applied
    pub timestamp: DateTime<Utc>,

    /// Payer, acting administrator, or debited side of a rollback
    pub sender: Option<AccountId>,

    /// Account whose balance changed (payee for PAY)
    pub receiver: Option<AccountId>,

    /// Currency
    pub currency: CurrencyId,

    /// Amount moved (for SET, the new balance)
    pub amount: Decimal,

    /// Kind of mutation
    pub kind: TransactionType,

    /// Balance before a SET
    pub old_balance: Option<Decimal>,

    /// Free-form note
    pub note: Option<String>,

    /// Transaction reverted by this ROLLBACK entry
    pub reverts: Option<Uuid>,
}

impl LogRecord {
    /// New record stamped with a fresh transaction id and the current time
    /// (millisecond precision, as stored)
    pub fn new(kind: TransactionType, currency: CurrencyId, amount: Decimal) -> Self {
        Self {
            transaction_id: Uuid::now_v7(),
            banknote_id: None,
            timestamp: Utc::now().trunc_subsecs(3),
            sender: None,
            receiver: None,
            currency,
            amount,
            kind,
            old_balance: None,
            note: None,
            reverts: None,
        }
    }

    /// Set the sender
    pub fn with_sender(mut self, sender: Option<AccountId>) -> Self {
        self.sender = sender;
        self
    }

    /// Set the receiver
    pub fn with_receiver(mut self, receiver: Option<AccountId>) -> Self {
        self.receiver = receiver;
        self
    }
}

/// A persisted transaction log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    /// Store-assigned sequence number
    pub log_id: i64,

    /// Transaction ID
    pub transaction_id: Uuid,

    /// External reference
    pub banknote_id: Option<Uuid>,

    /// When the mutation was applied
    pub timestamp: DateTime<Utc>,

    /// Sender
    pub sender: Option<AccountId>,

    /// Receiver
    pub receiver: Option<AccountId>,

    /// Currency
    pub currency: CurrencyId,

    /// Amount
    pub amount: Decimal,

    /// Kind of mutation
    pub kind: TransactionType,

    /// Set once by a successful rollback
    pub reverted: bool,

    /// Balance before a SET
    pub old_balance: Option<Decimal>,

    /// Free-form note
    pub note: Option<String>,

    /// Transaction reverted by this ROLLBACK entry
    pub reverts: Option<Uuid>,
}

impl TransactionLogEntry {
    /// Materialize a record under its store-assigned id
    pub fn from_record(log_id: i64, record: LogRecord) -> Self {
        Self {
            log_id,
            transaction_id: record.transaction_id,
            banknote_id: record.banknote_id,
            timestamp: record.timestamp,
            sender: record.sender,
            receiver: record.receiver,
            currency: record.currency,
            amount: record.amount,
            kind: record.kind,
            reverted: false,
            old_balance: record.old_balance,
            note: record.note,
            reverts: record.reverts,
        }
    }

    /// Whether the account appears on either side
    pub fn involves(&self, account: &AccountId) -> bool {
        self.sender.as_ref() == Some(account) || self.receiver.as_ref() == Some(account)
    }
}

/// One row of a leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based rank
    pub rank: u32,

    /// Display name ("Unknown" when the name index has none)
    pub display_name: String,

    /// Balance in the board's currency
    pub balance: Decimal,
}

/// User row of a bulk dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Account ID
    pub account_id: AccountId,
    /// Display name
    pub display_name: String,
}

/// Balance row of a bulk dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Account ID
    pub account_id: AccountId,
    /// Currency
    pub currency: CurrencyId,
    /// Balance
    pub amount: Decimal,
}

/// Backend-neutral snapshot exchanged with migration adapters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDump {
    /// Name index
    pub users: Vec<UserRecord>,
    /// Balance rows
    pub balances: Vec<BalanceRecord>,
}

impl DataDump {
    /// Read a JSON dump produced by an adapter
    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the dump as pretty JSON
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Group the rows into accounts
    pub fn into_accounts(self) -> Vec<Account> {
        let mut accounts: BTreeMap<AccountId, Account> = BTreeMap::new();
        for user in self.users {
            accounts
                .entry(user.account_id)
                .or_insert_with(|| Account::new(user.account_id, String::new()))
                .display_name = user.display_name;
        }
        for row in self.balances {
            accounts
                .entry(row.account_id)
                .or_insert_with(|| Account::new(row.account_id, String::new()))
                .set_balance(row.currency, row.amount);
        }
        accounts.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_id_normalized() {
        assert_eq!(CurrencyId::new("  Dollar "), CurrencyId::new("dollar"));
        let parsed: CurrencyId = serde_json::from_str("\"GEMS\"").unwrap();
        assert_eq!(parsed.as_str(), "gems");
    }

    #[test]
    fn test_account_balance_defaults_to_zero() {
        let mut account = Account::new(AccountId::new_v4(), "Steve");
        let dollar = CurrencyId::new("dollar");
        assert_eq!(account.balance(&dollar), Decimal::ZERO);

        account.set_balance(dollar.clone(), Decimal::new(1250, 2));
        assert_eq!(account.balance(&dollar), Decimal::new(1250, 2));
    }

    #[test]
    fn test_transaction_type_categories() {
        assert!(TransactionType::Pay.in_category(LogCategory::Trade));
        assert!(!TransactionType::Pay.in_category(LogCategory::Admin));
        assert!(TransactionType::Set.in_category(LogCategory::Admin));
        assert!(TransactionType::Rollback.in_category(LogCategory::All));
        assert!(!TransactionType::Rollback.in_category(LogCategory::Trade));
        assert_eq!("TAKE".parse::<TransactionType>().unwrap(), TransactionType::Take);
        assert!("COMMAND".parse::<TransactionType>().is_err());
    }

    #[test]
    fn test_dump_groups_into_accounts() {
        let id = AccountId::new_v4();
        let dump = DataDump {
            users: vec![UserRecord { account_id: id, display_name: "Alex".into() }],
            balances: vec![
                BalanceRecord { account_id: id, currency: "dollar".into(), amount: Decimal::new(5, 0) },
                BalanceRecord { account_id: id, currency: "gems".into(), amount: Decimal::new(7, 0) },
            ],
        };

        let accounts = dump.into_accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].display_name, "Alex");
        assert_eq!(accounts[0].balances.len(), 2);
    }

    #[test]
    fn test_dump_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let id = AccountId::new_v4();
        let dump = DataDump {
            users: vec![UserRecord { account_id: id, display_name: "Alex".into() }],
            balances: vec![BalanceRecord {
                account_id: id,
                currency: "dollar".into(),
                amount: Decimal::new(12345, 2),
            }],
        };

        dump.write_json(&path).unwrap();
        assert_eq!(DataDump::read_json(&path).unwrap(), dump);
    }
}
