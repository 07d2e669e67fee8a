//! Write-behind worker
//!
//! Balance rows and log entries reach the durable store through one
//! single-writer task, so the caller's critical path never waits on I/O:
//! - The engine enqueues while it still holds the account lock, so the
//!   worker sees writes for an account in lock order
//! - Batching amortizes transaction cost
//! - Every write can carry an acknowledgement the caller may await
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │     LedgerEngine / TransactionLog / sessions          │
//! │        (any thread, holding account locks)            │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ WriterHandle::submit (never blocks)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             WriteBehindWorker (single task)            │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Batch: Vec<WriteOp> + acknowledgements         │  │
//! │  │ Timer: 10ms or 100 ops → flush()               │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                               │
//! │                       ▼                               │
//! │        Backend::apply_batch() with retries            │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::config::WriteBehindConfig;
use crate::metrics::Metrics;
use crate::storage::{Backend, WriteOp};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};

/// Acknowledgement for one durable write
pub type Ack = oneshot::Sender<Result<()>>;

/// Message sent to the write-behind worker
#[derive(Debug)]
pub enum WriterMessage {
    /// Queue a write
    Write {
        /// Operation
        op: WriteOp,
        /// Acknowledgement, if anyone waits
        ack: Option<Ack>,
    },

    /// Flush everything queued so far
    Flush {
        response: oneshot::Sender<Result<()>>,
    },

    /// Flush and stop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Awaitable durable-commit receipt for a mutation.
///
/// Dropping it is fine: the writes still happen and failures are logged.
#[derive(Debug, Default)]
pub struct Commit {
    pending: Vec<oneshot::Receiver<Result<()>>>,
}

impl Commit {
    pub(crate) fn push(&mut self, ack: oneshot::Receiver<Result<()>>) {
        self.pending.push(ack);
    }

    /// Number of writes covered
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no writes are covered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait until every covered write is durable
    pub async fn wait(self) -> Result<()> {
        for ack in self.pending {
            ack.await.map_err(|_| {
                Error::Concurrency("Write-behind worker stopped before acknowledging".to_string())
            })??;
        }
        Ok(())
    }
}

/// Worker that owns the durable store's write path
#[derive(Debug)]
pub struct WriteBehindWorker {
    /// Storage backend
    store: Arc<dyn Backend>,

    /// Mailbox for incoming messages
    mailbox: mpsc::UnboundedReceiver<WriterMessage>,

    /// Queued operations, in arrival order
    batch: Vec<WriteOp>,

    /// Acknowledgements for queued operations
    acks: Vec<Ack>,

    /// Maximum batch size (operations)
    max_batch_size: usize,

    /// Batch timeout
    batch_timeout: Duration,

    /// Batching enabled
    batching_enabled: bool,

    /// Retries per failed batch
    max_retries: u32,

    /// Linear backoff step
    retry_backoff: Duration,

    metrics: Metrics,
}

impl WriteBehindWorker {
    /// Create new worker
    pub fn new(
        store: Arc<dyn Backend>,
        mailbox: mpsc::UnboundedReceiver<WriterMessage>,
        config: &WriteBehindConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            mailbox,
            batch: Vec::with_capacity(config.max_batch_size),
            acks: Vec::new(),
            max_batch_size: config.max_batch_size.max(1),
            batch_timeout: config.batch_timeout().max(Duration::from_millis(1)),
            batching_enabled: config.enabled,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            metrics,
        }
    }

    /// Run the worker event loop
    pub async fn run(mut self) {
        let mut batch_timer = interval(self.batch_timeout);
        batch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(backend = self.store.name(), "Write-behind worker started");

        loop {
            tokio::select! {
                // Process incoming messages
                Some(msg) = self.mailbox.recv() => {
                    match msg {
                        WriterMessage::Write { op, ack } => {
                            self.batch.push(op);
                            self.acks.extend(ack);

                            if !self.batching_enabled || self.batch.len() >= self.max_batch_size {
                                let _ = self.flush().await;
                            }
                        }
                        WriterMessage::Flush { response } => {
                            let result = self.flush().await;
                            let _ = response.send(result);
                        }
                        WriterMessage::Shutdown { response } => {
                            let _ = self.flush().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }

                // Batch timeout expired
                _ = batch_timer.tick(), if self.batching_enabled && !self.batch.is_empty() => {
                    let _ = self.flush().await;
                }

                // Mailbox closed
                else => {
                    let _ = self.flush().await;
                    break;
                }
            }
        }

        tracing::debug!("Write-behind worker stopped");
    }

    /// Write the current batch, retrying on failure
    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let ops = std::mem::take(&mut self.batch);
        let acks = std::mem::take(&mut self.acks);
        tracing::trace!("Flushing batch of {} writes", ops.len());

        let mut attempt = 0;
        let result = loop {
            match self.store.apply_batch(&ops).await {
                Ok(()) => break Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        writes = ops.len(),
                        error = %e,
                        "Durable write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.metrics.record_batch_flush(ops.len());
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                for op in &ops {
                    log_lost_write(op, &message);
                }
                self.metrics.record_write_failures(ops.len());
                for ack in acks {
                    let _ = ack.send(Err(Error::Storage(message.clone())));
                }
                Err(Error::Storage(message))
            }
        }
    }
}

/// Log a write that exhausted its retries with enough context to reconcile it by hand
fn log_lost_write(op: &WriteOp, error: &str) {
    match op {
        WriteOp::SetBalance { account, currency, balance } => tracing::error!(
            operation = op.kind(),
            account = %account,
            currency = %currency,
            balance = %balance,
            error,
            "Durable write lost, manual reconciliation required"
        ),
        WriteOp::SaveAccount(account) => tracing::error!(
            operation = op.kind(),
            account = %account.id,
            balances = ?account.balances,
            error,
            "Durable write lost, manual reconciliation required"
        ),
        WriteOp::UpdateName { account, display_name } => tracing::error!(
            operation = op.kind(),
            account = %account,
            display_name = display_name.as_str(),
            error,
            "Durable write lost"
        ),
        WriteOp::AppendLog(record) => tracing::error!(
            operation = op.kind(),
            transaction_id = %record.transaction_id,
            kind = %record.kind,
            sender = ?record.sender,
            receiver = ?record.receiver,
            currency = %record.currency,
            amount = %record.amount,
            error,
            "Log append lost, manual reconciliation required"
        ),
    }
}

/// Handle for sending writes to the worker
#[derive(Clone, Debug)]
pub struct WriterHandle {
    sender: mpsc::UnboundedSender<WriterMessage>,
}

impl WriterHandle {
    /// Create new handle
    pub fn new(sender: mpsc::UnboundedSender<WriterMessage>) -> Self {
        Self { sender }
    }

    /// Queue a write and get its acknowledgement
    pub fn submit(&self, op: WriteOp) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.send(op, Some(tx));
        rx
    }

    /// Queue a write nobody will wait for
    pub fn submit_detached(&self, op: WriteOp) {
        self.send(op, None);
    }

    fn send(&self, op: WriteOp, ack: Option<Ack>) {
        if let Err(mpsc::error::SendError(WriterMessage::Write { op, .. })) =
            self.sender.send(WriterMessage::Write { op, ack })
        {
            // The ack sender is dropped here, so a waiting caller sees the failure
            log_lost_write(&op, "write-behind worker stopped");
        }
    }

    /// Wait until everything queued before this call is durable
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriterMessage::Flush { response: tx })
            .map_err(|_| Error::Concurrency("Writer mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Flush and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriterMessage::Shutdown { response: tx })
            .map_err(|_| Error::Concurrency("Writer mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Whether the worker has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawn the write-behind worker
pub fn spawn_writer(
    store: Arc<dyn Backend>,
    config: &WriteBehindConfig,
    metrics: Metrics,
) -> WriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = WriteBehindWorker::new(store, rx, config, metrics);

    tokio::spawn(async move {
        worker.run().await;
    });

    WriterHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FaultyStore;
    use crate::storage::{AccountStore, MemoryStore};
    use crate::types::{AccountId, CurrencyId, LogRecord, TransactionType};
    use rust_decimal::Decimal;

    fn config(enabled: bool) -> WriteBehindConfig {
        WriteBehindConfig {
            max_batch_size: 10,
            batch_timeout_ms: 20,
            enabled,
            max_retries: 2,
            retry_backoff_ms: 1,
        }
    }

    fn set_op(account: AccountId, amount: i64) -> WriteOp {
        WriteOp::SetBalance {
            account,
            currency: CurrencyId::new("dollar"),
            balance: Decimal::new(amount, 0),
        }
    }

    #[tokio::test]
    async fn test_writer_spawn_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_writer(store, &config(true), Metrics::new().unwrap());

        handle.shutdown().await.unwrap();
        assert!(handle.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_acknowledged_write_is_durable() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_writer(store.clone(), &config(true), Metrics::new().unwrap());
        let id = AccountId::new_v4();

        let mut commit = Commit::default();
        commit.push(handle.submit(set_op(id, 5)));
        commit.wait().await.unwrap();

        assert_eq!(
            store.balance(&id, &CurrencyId::new("dollar")).await.unwrap(),
            Some(Decimal::new(5, 0))
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_is_a_barrier_and_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_writer(store.clone(), &config(true), Metrics::new().unwrap());
        let id = AccountId::new_v4();

        for amount in 1..=25 {
            handle.submit_detached(set_op(id, amount));
        }
        let record = LogRecord::new(TransactionType::Deposit, CurrencyId::new("dollar"), Decimal::ONE);
        handle.submit_detached(WriteOp::AppendLog(record));
        handle.flush().await.unwrap();

        assert_eq!(
            store.balance(&id, &CurrencyId::new("dollar")).await.unwrap(),
            Some(Decimal::new(25, 0))
        );
        assert_eq!(store.log_len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(FaultyStore::default());
        store.fail_next(2);
        let metrics = Metrics::new().unwrap();
        let handle = spawn_writer(store.clone(), &config(false), metrics.clone());
        let id = AccountId::new_v4();

        handle.submit(set_op(id, 7)).await.unwrap().unwrap();

        assert_eq!(
            store.balance(&id, &CurrencyId::new("dollar")).await.unwrap(),
            Some(Decimal::new(7, 0))
        );
        assert_eq!(metrics.write_failures_total.get(), 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_acknowledgement() {
        let store = Arc::new(FaultyStore::default());
        store.fail_next(10);
        let metrics = Metrics::new().unwrap();
        let handle = spawn_writer(store.clone(), &config(false), metrics.clone());

        let result = handle.submit(set_op(AccountId::new_v4(), 1)).await.unwrap();

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(metrics.write_failures_total.get(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_reports_failure() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_writer(store, &config(true), Metrics::new().unwrap());
        handle.shutdown().await.unwrap();

        let mut commit = Commit::default();
        commit.push(handle.submit(set_op(AccountId::new_v4(), 1)));
        assert!(matches!(commit.wait().await, Err(Error::Concurrency(_))));
    }
}
