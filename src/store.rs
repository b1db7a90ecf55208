//! Message store abstractions and backend drivers.
//!
//! The store is the durable record of messages and their
//! [`DeliveryState`]. It is also the only resource shared between dispatch
//! workers, so it owns the one correctness-critical operation of the whole
//! pipeline: [`MessageStore::claim_batch`].
//!
//! ## Responsibilities
//!
//! - Persist messages and their delivery state
//! - Atomically select and mark the lowest pending messages for one worker
//! - Apply bulk state updates reported back by workers
//!
//! ## Components
//!
//! - [`Store`]: High-level façade used by workers and the coordinator
//! - [`MessageStore`]: Trait implemented by store backends
//! - [`InsertMessages`]: Trait for bulk population of the queue
//!
//! Concrete implementations are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{DeliveryState, Message, MessageId, NewMessage};

pub use inmemory::{InMemoryStore, InMemoryStoreError};

/// Error returned by store operations.
///
/// Wraps the backend error together with the failed operation and a tracing
/// span backtrace.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    operation: &'static str,
    source: tower::BoxError,
}

impl StoreError {
    fn backend(operation: &'static str, err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            operation,
            source: err,
        }
    }

    /// Name of the store operation that failed.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store error during {}: {}", self.operation, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Trait implemented by store backends.
///
/// `claim_batch` must be linearizable with respect to other `claim_batch`
/// calls: no two calls, from any task or process, may return overlapping
/// identifiers. The remaining operations only need to be individually atomic.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Select up to `limit` pending messages, lowest identifiers first, and
    /// mark them dispatched in the same atomic unit.
    ///
    /// Returns the claimed messages in ascending identifier order. An empty
    /// result means no message is pending.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Message>, Self::Error>;

    /// Set `state` on every message with `low <= id <= high`.
    async fn set_state_range(
        &self,
        low: MessageId,
        high: MessageId,
        state: DeliveryState,
    ) -> Result<u64, Self::Error>;

    /// Set `state` on every message in `ids`.
    async fn set_state_ids(
        &self,
        ids: &[MessageId],
        state: DeliveryState,
    ) -> Result<u64, Self::Error>;

    /// Count messages that are not dispatched (pending or failed).
    async fn count_not_dispatched(&self) -> Result<u64, Self::Error>;

    /// Count messages in `state`.
    async fn count_by_state(&self, state: DeliveryState) -> Result<u64, Self::Error>;

    /// Move every failed message back to pending.
    async fn requeue_failed(&self) -> Result<u64, Self::Error>;
}

/// Trait for populating the store.
///
/// Insertion happens before dispatch starts and is not expected to run
/// concurrently with workers.
#[async_trait::async_trait]
pub trait InsertMessages {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Insert all messages as pending, or none of them.
    ///
    /// Returns the identifiers assigned by the store, in input order.
    async fn insert_messages(&self, msgs: Vec<NewMessage>) -> Result<Vec<MessageId>, Self::Error>;
}

/// High-level façade over a store backend.
///
/// `Store` maps backend errors into [`StoreError`] and instruments every
/// operation. It is cheap to clone when the backend is.
#[derive(Debug, Clone)]
pub struct Store<D>(D);

impl<D> Store<D> {
    /// Create a new store façade over the given backend.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Access the underlying backend.
    pub fn driver(&self) -> &D {
        &self.0
    }
}

impl<D> Store<D>
where
    D: InsertMessages + Sync,
{
    /// Insert messages into the queue as pending.
    #[instrument(skip_all, fields(count = msgs.len()))]
    pub async fn insert_messages(&self, msgs: Vec<NewMessage>) -> Result<Vec<MessageId>, StoreError> {
        self.0
            .insert_messages(msgs)
            .await
            .map_err(|e| StoreError::backend("insert_messages", e.into()))
    }
}

impl<D> Store<D>
where
    D: MessageStore,
{
    #[instrument(skip(self))]
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.0
            .claim_batch(limit)
            .await
            .map_err(|e| StoreError::backend("claim_batch", e.into()))
    }

    #[instrument(skip(self))]
    pub async fn set_state_range(
        &self,
        low: MessageId,
        high: MessageId,
        state: DeliveryState,
    ) -> Result<u64, StoreError> {
        let updated = self
            .0
            .set_state_range(low, high, state)
            .await
            .map_err(|e| StoreError::backend("set_state_range", e.into()))?;
        if updated == 0 && low <= high {
            tracing::debug!(low, high, %state, "Range update matched no messages");
        }
        Ok(updated)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn set_state_ids(
        &self,
        ids: &[MessageId],
        state: DeliveryState,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.0
            .set_state_ids(ids, state)
            .await
            .map_err(|e| StoreError::backend("set_state_ids", e.into()))
    }

    #[instrument(skip(self))]
    pub async fn count_not_dispatched(&self) -> Result<u64, StoreError> {
        self.0
            .count_not_dispatched()
            .await
            .map_err(|e| StoreError::backend("count_not_dispatched", e.into()))
    }

    #[instrument(skip(self))]
    pub async fn count_by_state(&self, state: DeliveryState) -> Result<u64, StoreError> {
        self.0
            .count_by_state(state)
            .await
            .map_err(|e| StoreError::backend("count_by_state", e.into()))
    }

    #[instrument(skip(self))]
    pub async fn requeue_failed(&self) -> Result<u64, StoreError> {
        self.0
            .requeue_failed()
            .await
            .map_err(|e| StoreError::backend("requeue_failed", e.into()))
    }
}
