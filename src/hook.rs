//! Lifecycle hooks for dispatch workers.

use crate::{Batch, SendReport, WorkerStats, message::RangeDisplay};

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are shared by every worker of a coordinator and invoked
/// synchronously from the worker tasks, so they should avoid heavy or blocking
/// work. Typical use cases include logging, metrics, and progress reporting.
pub trait DispatchHook: Send + Sync {
    fn on_worker_started(&self, worker: usize);
    fn on_batch_claimed(&self, worker: usize, batch: &Batch);
    fn on_connect_error(&self, worker: usize, batch: &Batch, error: &dyn std::error::Error);
    fn on_batch_sent(&self, worker: usize, batch: &Batch, report: &SendReport);
    fn on_store_error(&self, worker: usize, error: &dyn std::error::Error);
    fn on_worker_done(&self, worker: usize, stats: &WorkerStats);
}

/// Default hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDispatchHook;

impl DispatchHook for DefaultDispatchHook {
    fn on_worker_started(&self, worker: usize) {
        tracing::info!(worker, "Worker started");
    }

    fn on_batch_claimed(&self, worker: usize, batch: &Batch) {
        tracing::info!(
            worker,
            range = %RangeDisplay(batch.range()),
            size = batch.len(),
            "Sending next batch"
        );
    }

    fn on_connect_error(&self, worker: usize, batch: &Batch, error: &dyn std::error::Error) {
        tracing::error!(
            worker,
            range = %RangeDisplay(batch.range()),
            %error,
            "Could not connect, batch handed back"
        );
    }

    fn on_batch_sent(&self, worker: usize, batch: &Batch, report: &SendReport) {
        tracing::info!(
            worker,
            range = %RangeDisplay(batch.range()),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            unprocessed = report.unprocessed.len(),
            "Batch sent"
        );
    }

    fn on_store_error(&self, worker: usize, error: &dyn std::error::Error) {
        tracing::error!(worker, %error, "Store operation failed");
    }

    fn on_worker_done(&self, worker: usize, stats: &WorkerStats) {
        tracing::info!(
            worker,
            batches = stats.batches,
            delivered = stats.delivered,
            failed = stats.failed,
            requeued = stats.requeued,
            connect_failed = stats.connect_failed,
            session_lost = stats.session_lost,
            "Worker exiting"
        );
    }
}
