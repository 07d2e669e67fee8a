//! Leaderboard cache
//!
//! Cache-aside top-N lists per currency. A stale or empty board triggers a
//! refresh against the durable store, which includes offline accounts.
//! Only one refresh per currency runs at a time; callers arriving during a
//! refresh get the current (possibly stale) board instead of waiting.

use crate::config::LeaderboardConfig;
use crate::currency::CurrencyRegistry;
use crate::metrics::Metrics;
use crate::storage::{AccountStore, Backend};
use crate::types::{CurrencyId, LeaderboardEntry};
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone)]
struct Board {
    entries: Arc<Vec<LeaderboardEntry>>,
    refreshed_at: Instant,
}

/// Per-currency refresh flag, cleared on drop
struct RefreshGuard<'a> {
    in_flight: &'a Mutex<HashSet<CurrencyId>>,
    currency: CurrencyId,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.currency);
    }
}

/// Leaderboard cache
#[derive(Debug)]
pub struct LeaderboardCache {
    store: Arc<dyn Backend>,
    currencies: Arc<CurrencyRegistry>,
    config: LeaderboardConfig,
    boards: DashMap<CurrencyId, Board>,
    in_flight: Mutex<HashSet<CurrencyId>>,
    metrics: Metrics,
}

impl LeaderboardCache {
    /// Create an empty cache
    pub fn new(
        store: Arc<dyn Backend>,
        currencies: Arc<CurrencyRegistry>,
        config: LeaderboardConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            currencies,
            config,
            boards: DashMap::new(),
            in_flight: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    /// Top balances for a currency, refreshing first if stale
    pub async fn get_top(&self, currency: &str) -> Result<Arc<Vec<LeaderboardEntry>>> {
        if !self.config.enabled {
            return Ok(Arc::new(Vec::new()));
        }
        let currency = self.currencies.resolve(currency)?;

        if let Some(board) = self.boards.get(&currency) {
            if board.refreshed_at.elapsed() < self.config.ttl() && !board.entries.is_empty() {
                return Ok(board.entries.clone());
            }
        }

        match self.refresh_id(&currency).await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(currency = %currency, error = %e, "Leaderboard refresh failed, serving cached board");
                Ok(self.current(&currency))
            }
        }
    }

    /// One page of the board; pages start at 1
    pub async fn page(&self, currency: &str, page: u32) -> Result<Vec<LeaderboardEntry>> {
        let top = self.get_top(currency).await?;
        let size = self.config.page_size as usize;
        let start = (page.max(1) as usize - 1) * size;
        Ok(top.iter().skip(start).take(size).cloned().collect())
    }

    /// Rebuild a board from the store unless a refresh is already running
    pub async fn refresh(&self, currency: &str) -> Result<Arc<Vec<LeaderboardEntry>>> {
        if !self.config.enabled {
            return Ok(Arc::new(Vec::new()));
        }
        let currency = self.currencies.resolve(currency)?;
        self.refresh_id(&currency).await
    }

    /// Age of a cached board
    pub fn last_refreshed(&self, currency: &str) -> Option<Duration> {
        let currency = CurrencyId::new(currency);
        self.boards.get(&currency).map(|board| board.refreshed_at.elapsed())
    }

    /// Refresh every configured currency on a fixed period
    pub fn spawn_refresher(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let ids: Vec<CurrencyId> =
                    self.currencies.snapshot().all().iter().map(|c| c.id.clone()).collect();
                for currency in ids {
                    if let Err(e) = self.refresh_id(&currency).await {
                        tracing::warn!(currency = %currency, error = %e, "Periodic leaderboard refresh failed");
                    }
                }
            }
        })
    }

    async fn refresh_id(&self, currency: &CurrencyId) -> Result<Arc<Vec<LeaderboardEntry>>> {
        let _guard = match self.begin_refresh(currency) {
            Some(guard) => guard,
            None => return Ok(self.current(currency)),
        };

        let rows = self.store.top_balances(currency, self.config.size).await?;
        let entries: Vec<LeaderboardEntry> = rows
            .into_iter()
            .enumerate()
            .map(|(index, (name, balance))| LeaderboardEntry {
                rank: index as u32 + 1,
                display_name: name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| UNKNOWN_NAME.to_string()),
                balance,
            })
            .collect();

        let entries = Arc::new(entries);
        self.boards.insert(
            currency.clone(),
            Board { entries: entries.clone(), refreshed_at: Instant::now() },
        );
        self.metrics.record_leaderboard_refresh();
        tracing::debug!(currency = %currency, rows = entries.len(), "Leaderboard refreshed");

        Ok(entries)
    }

    fn begin_refresh(&self, currency: &CurrencyId) -> Option<RefreshGuard<'_>> {
        if self.in_flight.lock().insert(currency.clone()) {
            Some(RefreshGuard { in_flight: &self.in_flight, currency: currency.clone() })
        } else {
            None
        }
    }

    fn current(&self, currency: &CurrencyId) -> Arc<Vec<LeaderboardEntry>> {
        self.boards
            .get(currency)
            .map(|board| board.entries.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::storage::{AccountStore, MemoryStore};
    use crate::types::{Account, AccountId};
    use rust_decimal::Decimal;

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (name, balance) in [("alex", 50), ("blake", 300), ("casey", 120)] {
            let mut account = Account::new(AccountId::new_v4(), name);
            account.set_balance(CurrencyId::new("dollar"), Decimal::new(balance, 0));
            store.save(&account).await.unwrap();
        }
        store
    }

    fn cache(store: Arc<MemoryStore>, config: LeaderboardConfig) -> LeaderboardCache {
        LeaderboardCache::new(
            store,
            Arc::new(CurrencyRegistry::new(vec![Currency::dollar()]).unwrap()),
            config,
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ranks_descending() {
        let board = cache(seeded().await, LeaderboardConfig::default());
        let top = board.get_top("dollar").await.unwrap();

        let names: Vec<_> = top.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["blake", "casey", "alex"]);
        assert_eq!(top[0].rank, 1);
        assert!(board.last_refreshed("dollar").is_some());
    }

    #[tokio::test]
    async fn test_fresh_board_is_served_from_cache() {
        let store = seeded().await;
        let board = cache(store.clone(), LeaderboardConfig::default());
        board.get_top("dollar").await.unwrap();

        let mut rich = Account::new(AccountId::new_v4(), "drew");
        rich.set_balance(CurrencyId::new("dollar"), Decimal::new(10_000, 0));
        store.save(&rich).await.unwrap();

        assert_eq!(board.get_top("dollar").await.unwrap()[0].display_name, "blake");
        assert_eq!(board.refresh("dollar").await.unwrap()[0].display_name, "drew");
        assert_eq!(board.metrics.leaderboard_refreshes_total.get(), 2);
    }

    #[tokio::test]
    async fn test_refresh_in_flight_serves_current() {
        let board = cache(seeded().await, LeaderboardConfig::default());
        let currency = CurrencyId::new("dollar");

        let _held = board.begin_refresh(&currency).unwrap();
        assert!(board.get_top("dollar").await.unwrap().is_empty());
        assert_eq!(board.metrics.leaderboard_refreshes_total.get(), 0);
    }

    #[tokio::test]
    async fn test_pages_and_unknown_names() {
        let store = seeded().await;
        store
            .set_balance(&AccountId::new_v4(), &CurrencyId::new("dollar"), Decimal::new(1, 0))
            .await
            .unwrap();
        let board = cache(store, LeaderboardConfig { page_size: 2, ..LeaderboardConfig::default() });

        assert_eq!(board.page("dollar", 1).await.unwrap().len(), 2);
        let second = board.page("dollar", 2).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].display_name, "Unknown");
        assert!(board.page("dollar", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_board_is_empty() {
        let board = cache(
            seeded().await,
            LeaderboardConfig { enabled: false, ..LeaderboardConfig::default() },
        );
        assert!(board.get_top("dollar").await.unwrap().is_empty());
        assert!(board.get_top("nope").await.unwrap().is_empty());
    }
}
