//! SQLite backend (sqlx)
//!
//! # Tables
//!
//! - `users` - name index (key: account_id)
//! - `balances` - one row per (account_id, currency_id), amounts as exact decimal text
//! - `transaction_logs` - append-only log indexed by transaction, sender, receiver and banknote
//!
//! The schema lives in `migrations/` and is applied by sqlx's migrator.

use super::{AccountStore, Backend, LogStore, WriteOp};
use crate::types::{
    Account, AccountId, BalanceRecord, CurrencyId, DataDump, LogCategory, LogRecord,
    TransactionLogEntry, UserRecord,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and migrate it
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(url, max_connections, "Opened SQLite store");
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Highest applied migration (0 for a fresh database)
    pub async fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// Statement helpers shared by single writes and batches

async fn upsert_user(conn: &mut SqliteConnection, id: &AccountId, display_name: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (account_id, display_name, last_seen)
        VALUES (?, ?, ?)
        ON CONFLICT (account_id) DO UPDATE SET
            display_name = excluded.display_name,
            last_seen = excluded.last_seen
        "#,
    )
    .bind(id.as_uuid())
    .bind(display_name)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_balance(
    conn: &mut SqliteConnection,
    id: &AccountId,
    currency: &CurrencyId,
    amount: Decimal,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO balances (account_id, currency_id, balance, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (account_id, currency_id) DO UPDATE SET
            balance = excluded.balance,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.as_uuid())
    .bind(currency.as_str())
    .bind(amount.to_string())
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

async fn save_account(conn: &mut SqliteConnection, account: &Account) -> Result<()> {
    upsert_user(&mut *conn, &account.id, &account.display_name).await?;
    for (currency, amount) in &account.balances {
        upsert_balance(&mut *conn, &account.id, currency, *amount).await?;
    }
    Ok(())
}

async fn insert_log(conn: &mut SqliteConnection, record: &LogRecord) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO transaction_logs (
            transaction_id, banknote_id, logged_at, sender_id, receiver_id,
            currency_id, amount, type, reverted, old_balance, note, reverts
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(record.transaction_id)
    .bind(record.banknote_id)
    .bind(record.timestamp)
    .bind(record.sender.map(|id| *id.as_uuid()))
    .bind(record.receiver.map(|id| *id.as_uuid()))
    .bind(record.currency.as_str())
    .bind(record.amount.to_string())
    .bind(record.kind.as_str())
    .bind(record.old_balance.map(|b| b.to_string()))
    .bind(record.note.as_deref())
    .bind(record.reverts)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

fn parse_decimal(text: &str) -> Result<Decimal> {
    Ok(Decimal::from_str(text)?)
}

fn account_column(row: &SqliteRow, column: &str) -> Result<Option<AccountId>> {
    Ok(row.try_get::<Option<Uuid>, _>(column)?.map(AccountId::from))
}

fn entry_from_row(row: &SqliteRow) -> Result<TransactionLogEntry> {
    let kind: String = row.try_get("type")?;
    let old_balance: Option<String> = row.try_get("old_balance")?;

    Ok(TransactionLogEntry {
        log_id: row.try_get("log_id")?,
        transaction_id: row.try_get("transaction_id")?,
        banknote_id: row.try_get("banknote_id")?,
        timestamp: row.try_get("logged_at")?,
        sender: account_column(row, "sender_id")?,
        receiver: account_column(row, "receiver_id")?,
        currency: CurrencyId::new(row.try_get::<String, _>("currency_id")?),
        amount: parse_decimal(&row.try_get::<String, _>("amount")?)?,
        kind: kind.parse()?,
        reverted: row.try_get("reverted")?,
        old_balance: old_balance.as_deref().map(parse_decimal).transpose()?,
        note: row.try_get("note")?,
        reverts: row.try_get("reverts")?,
    })
}

const LOG_COLUMNS: &str = "log_id, transaction_id, banknote_id, logged_at, sender_id, receiver_id, \
     currency_id, amount, type, reverted, old_balance, note, reverts";

#[async_trait]
impl AccountStore for SqliteStore {
    async fn load(&self, id: &AccountId) -> Result<Option<Account>> {
        let key = id.as_uuid();
        let name: Option<String> =
            sqlx::query_scalar("SELECT display_name FROM users WHERE account_id = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let rows = sqlx::query("SELECT currency_id, balance FROM balances WHERE account_id = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;

        if name.is_none() && rows.is_empty() {
            return Ok(None);
        }

        let mut account = Account::new(*id, name.unwrap_or_default());
        for row in rows {
            let currency: String = row.try_get("currency_id")?;
            let balance: String = row.try_get("balance")?;
            account.set_balance(CurrencyId::new(currency), parse_decimal(&balance)?);
        }
        Ok(Some(account))
    }

    async fn save(&self, account: &Account) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        save_account(&mut tx, account).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn balance(&self, id: &AccountId, currency: &CurrencyId) -> Result<Option<Decimal>> {
        let balance: Option<String> = sqlx::query_scalar(
            "SELECT balance FROM balances WHERE account_id = ? AND currency_id = ?",
        )
        .bind(id.as_uuid())
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?;
        balance.as_deref().map(parse_decimal).transpose()
    }

    async fn set_balance(&self, id: &AccountId, currency: &CurrencyId, amount: Decimal) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_balance(&mut conn, id, currency, amount).await
    }

    async fn update_name(&self, id: &AccountId, display_name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_user(&mut conn, id, display_name).await
    }

    async fn find_by_name(&self, display_name: &str) -> Result<Option<AccountId>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT account_id FROM users WHERE display_name = ? COLLATE NOCASE ORDER BY last_seen DESC LIMIT 1",
        )
        .bind(display_name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(AccountId::from))
    }

    async fn top_balances(&self, currency: &CurrencyId, limit: u32) -> Result<Vec<(Option<String>, Decimal)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Float ranking is only a prefilter: everything at or above the
        // limit-th float value is fetched, then ranked exactly.
        let rows = sqlx::query(
            r#"
            SELECT u.display_name AS display_name, b.balance AS balance
            FROM balances b
            LEFT JOIN users u ON u.account_id = b.account_id
            WHERE b.currency_id = ?1
              AND CAST(b.balance AS REAL) >= COALESCE(
                  (SELECT CAST(balance AS REAL) FROM balances
                   WHERE currency_id = ?1
                   ORDER BY CAST(balance AS REAL) DESC
                   LIMIT 1 OFFSET ?2),
                  -9e999)
            "#,
        )
        .bind(currency.as_str())
        .bind(i64::from(limit) - 1)
        .fetch_all(&self.pool)
        .await?;

        let mut ranked = rows
            .iter()
            .map(|row| -> Result<(Option<String>, Decimal)> {
                let name: Option<String> = row.try_get("display_name")?;
                let balance: String = row.try_get("balance")?;
                Ok((name, parse_decimal(&balance)?))
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit as usize);
        Ok(ranked)
    }

    async fn dump_all(&self) -> Result<DataDump> {
        let users = sqlx::query("SELECT account_id, display_name FROM users ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| -> Result<UserRecord> {
                Ok(UserRecord {
                    account_id: AccountId::from(row.try_get::<Uuid, _>("account_id")?),
                    display_name: row.try_get("display_name")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let balances = sqlx::query(
            "SELECT account_id, currency_id, balance FROM balances ORDER BY account_id, currency_id",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<BalanceRecord> {
            Ok(BalanceRecord {
                account_id: AccountId::from(row.try_get::<Uuid, _>("account_id")?),
                currency: CurrencyId::new(row.try_get::<String, _>("currency_id")?),
                amount: parse_decimal(&row.try_get::<String, _>("balance")?)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(DataDump { users, balances })
    }

    async fn import(&self, dump: &DataDump) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user in &dump.users {
            upsert_user(&mut tx, &user.account_id, &user.display_name).await?;
        }
        for row in &dump.balances {
            upsert_balance(&mut tx, &row.account_id, &row.currency, row.amount).await?;
        }
        tx.commit().await?;

        tracing::info!(
            users = dump.users.len(),
            balances = dump.balances.len(),
            "Imported data dump"
        );
        Ok(())
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append_log(&self, record: &LogRecord) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut conn, record).await
    }

    async fn history(&self, account: &AccountId, offset: u64, limit: u64) -> Result<Vec<TransactionLogEntry>> {
        let key = account.as_uuid();
        let sql = format!(
            "SELECT {} FROM transaction_logs WHERE sender_id = ?1 OR receiver_id = ?1 \
             ORDER BY logged_at DESC, log_id DESC LIMIT ?2 OFFSET ?3",
            LOG_COLUMNS
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<TransactionLogEntry>> {
        let sql = format!(
            "SELECT {} FROM transaction_logs WHERE transaction_id = ? ORDER BY log_id LIMIT 1",
            LOG_COLUMNS
        );
        sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(entry_from_row)
            .transpose()
    }

    async fn find_by_banknote(&self, banknote_id: Uuid) -> Result<Vec<TransactionLogEntry>> {
        let sql = format!(
            "SELECT {} FROM transaction_logs WHERE banknote_id = ? ORDER BY log_id",
            LOG_COLUMNS
        );
        sqlx::query(&sql)
            .bind(banknote_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    async fn mark_reverted(&self, transaction_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transaction_logs SET reverted = 1 WHERE transaction_id = ? AND reverted = 0",
        )
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn entries_since(
        &self,
        account: &AccountId,
        since: DateTime<Utc>,
        category: LogCategory,
    ) -> Result<Vec<TransactionLogEntry>> {
        let key = account.as_uuid();
        let sql = format!(
            "SELECT {} FROM transaction_logs \
             WHERE (sender_id = ?1 OR receiver_id = ?1) AND logged_at >= ?2 AND reverted = 0 \
             ORDER BY logged_at DESC, log_id DESC",
            LOG_COLUMNS
        );
        let entries = sqlx::query(&sql)
            .bind(key)
            .bind(since)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(entries
            .into_iter()
            .filter(|e| e.kind.in_category(category))
            .collect())
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::SetBalance { account, currency, balance } => {
                    upsert_balance(&mut tx, account, currency, *balance).await?;
                }
                WriteOp::SaveAccount(account) => save_account(&mut tx, account).await?,
                WriteOp::UpdateName { account, display_name } => {
                    upsert_user(&mut tx, account, display_name).await?;
                }
                WriteOp::AppendLog(record) => {
                    insert_log(&mut tx, record).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
