//! Dispatch worker.
//!
//! A worker repeatedly claims a batch from the store, sends it over a fresh
//! session and writes the outcome back:
//!
//! ```text
//!            empty batch / cancelled
//!   FETCH ───────────────────────────────▶ DONE
//!     │ ▲                                   ▲
//!     ▼ │ reconciled                        │ connect failed or
//!   CONNECT ──▶ SEND ───────────────────────┤ session lost,
//!     └─────────────────────────────────────┘ batch handed back
//! ```
//!
//! Claimed messages are already `Dispatched` in the store. After sending,
//! rejected messages become `Failed` and messages the session never got to
//! become `Pending` again. Delivered messages need no write.
//!
//! A worker never retries on its own: messages handed back after a failed
//! connect or a lost session wait for the next pass of the coordinator.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Batch, Credentials, DeliveryState, DispatchHook, MessageId,
    message::RangeDisplay,
    store::{MessageStore, Store, StoreError},
    transport::{Connector, SendReport, Transport},
};

/// Counters of one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker: usize,
    pub batches: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Messages handed back as pending, after a lost session or a failed
    /// connect.
    pub requeued: u64,
    /// Whether the worker stopped because it could not connect.
    pub connect_failed: bool,
    /// Whether the worker stopped because its session was lost mid-batch.
    pub session_lost: bool,
}

enum Step<S> {
    Fetch,
    Connect(Batch),
    Send(Batch, Transport<S>),
    Done,
}

/// One dispatch worker.
pub struct Worker<D, C, HK> {
    id: usize,
    store: Store<D>,
    connector: C,
    credentials: Credentials,
    batch_size: usize,
    hook: Arc<HK>,
    cancel: CancellationToken,
}

impl<D, C, HK> Worker<D, C, HK>
where
    D: MessageStore,
    C: Connector,
    HK: DispatchHook,
{
    pub fn new(
        id: usize,
        store: Store<D>,
        connector: C,
        credentials: Credentials,
        batch_size: usize,
        hook: Arc<HK>,
    ) -> Self {
        Self {
            id,
            store,
            connector,
            credentials,
            batch_size,
            hook,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the worker before its next fetch once `cancel` is triggered.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the worker until no pending message is left.
    ///
    /// Stops early, without error, when a session cannot be established, a
    /// session is lost mid-batch, or the worker is cancelled. Store failures stop the worker with an error;
    /// messages of the batch in flight may then remain `Dispatched`.
    #[tracing::instrument(skip(self), fields(worker = self.id))]
    pub async fn run(self) -> Result<WorkerStats, WorkerError> {
        self.hook.on_worker_started(self.id);
        let mut stats = WorkerStats {
            worker: self.id,
            ..WorkerStats::default()
        };

        let mut step = Step::Fetch;
        loop {
            step = match step {
                Step::Fetch => self.fetch().await?,
                Step::Connect(batch) => self.connect(batch, &mut stats).await?,
                Step::Send(batch, transport) => self.send(batch, transport, &mut stats).await?,
                Step::Done => break,
            };
        }

        self.hook.on_worker_done(self.id, &stats);
        Ok(stats)
    }

    async fn fetch(&self) -> Result<Step<C::Session>, WorkerError> {
        if self.cancel.is_cancelled() {
            tracing::info!(worker = self.id, "Worker cancelled");
            return Ok(Step::Done);
        }
        let messages = self
            .store
            .claim_batch(self.batch_size)
            .await
            .map_err(|e| self.store_error(e, None))?;
        let batch = Batch::new(messages);
        if batch.is_empty() {
            return Ok(Step::Done);
        }
        self.hook.on_batch_claimed(self.id, &batch);
        Ok(Step::Connect(batch))
    }

    async fn connect(
        &self,
        batch: Batch,
        stats: &mut WorkerStats,
    ) -> Result<Step<C::Session>, WorkerError> {
        let mut transport = Transport::from_connector(&self.connector);
        match transport.connect(&self.credentials).await {
            Ok(()) => Ok(Step::Send(batch, transport)),
            Err(error) => {
                self.hook.on_connect_error(self.id, &batch, &error);
                transport.close().await;
                self.hand_back(&batch).await?;
                stats.requeued += batch.len() as u64;
                stats.connect_failed = true;
                Ok(Step::Done)
            }
        }
    }

    async fn send(
        &self,
        batch: Batch,
        mut transport: Transport<C::Session>,
        stats: &mut WorkerStats,
    ) -> Result<Step<C::Session>, WorkerError> {
        let report = transport.send_batch(batch.messages()).await;
        self.hook.on_batch_sent(self.id, &batch, &report);
        self.reconcile(&batch, &report).await?;

        stats.batches += 1;
        stats.delivered += report.delivered.len() as u64;
        stats.failed += report.failed.len() as u64;
        stats.requeued += report.unprocessed.len() as u64;

        if report.session_lost() {
            stats.session_lost = true;
            return Ok(Step::Done);
        }
        Ok(Step::Fetch)
    }

    /// Write the outcome of a sent batch back to the store.
    async fn reconcile(&self, batch: &Batch, report: &SendReport) -> Result<(), WorkerError> {
        self.update_ids(batch, &report.failed, DeliveryState::Failed)
            .await?;
        self.update_ids(batch, &report.unprocessed, DeliveryState::Pending)
            .await
    }

    /// Revert a whole claimed batch to pending.
    ///
    /// Only a contiguous batch may be reverted by range. A batch with gaps
    /// shares its range with messages it does not own.
    async fn hand_back(&self, batch: &Batch) -> Result<(), WorkerError> {
        match batch.range() {
            Some((low, high)) if batch.is_contiguous() => {
                self.store
                    .set_state_range(low, high, DeliveryState::Pending)
                    .await
                    .map_err(|e| self.store_error(e, batch.range()))?;
                Ok(())
            }
            Some(_) => self.update_ids(batch, &batch.ids(), DeliveryState::Pending).await,
            None => Ok(()),
        }
    }

    async fn update_ids(
        &self,
        batch: &Batch,
        ids: &[MessageId],
        state: DeliveryState,
    ) -> Result<(), WorkerError> {
        self.store
            .set_state_ids(ids, state)
            .await
            .map_err(|e| self.store_error(e, batch.range()))?;
        Ok(())
    }

    fn store_error(&self, error: StoreError, range: Option<(MessageId, MessageId)>) -> WorkerError {
        self.hook.on_store_error(self.id, &error);
        WorkerError::store(self.id, range, error)
    }
}

/// Error returned when a worker stops on a store failure.
#[derive(Debug)]
pub struct WorkerError {
    context: SpanTrace,
    worker: usize,
    range: Option<(MessageId, MessageId)>,
    source: StoreError,
}

impl WorkerError {
    fn store(worker: usize, range: Option<(MessageId, MessageId)>, source: StoreError) -> Self {
        Self {
            context: SpanTrace::capture(),
            worker,
            range,
            source,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Range of the batch in flight, if any.
    pub fn range(&self) -> Option<(MessageId, MessageId)> {
        self.range
    }

    pub fn store_error(&self) -> &StoreError {
        &self.source
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Worker {} stopped on batch {}: {}",
            self.worker,
            RangeDisplay(self.range),
            self.source
        )?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
