//! Dispatch coordinator.
//!
//! The coordinator runs a fixed pool of [`Worker`]s to completion against a
//! shared store, then reports what is left. [`Coordinator::run_with_retry`]
//! adds the bounded retry loop on top: as long as messages remain
//! undispatched and the caller agrees, the whole pool runs again with fresh
//! sessions and fresh batch boundaries.

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    DefaultDispatchHook, DeliveryState, DispatchConfig, DispatchHook, StoreErrorPolicy,
    store::{MessageStore, Store, StoreError},
    transport::Connector,
    worker::{Worker, WorkerError, WorkerStats},
};

/// Per-run worker count and batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Messages claimed per batch by each worker.
    pub batch_size: usize,
    /// Workers actually spawned.
    pub workers: usize,
}

impl BatchPlan {
    /// Plan a run over `total` messages with `workers` workers.
    ///
    /// Below `ceiling` messages, the total is split evenly between workers;
    /// above it, the ceiling is. Either way at most
    /// `max(total, ceiling)` messages are held in memory at once. When there
    /// are fewer messages to share than workers, only as many workers as
    /// messages are spawned, each with a batch size of one.
    pub fn new(total: u64, workers: usize, ceiling: u64) -> Self {
        let budget = if total < ceiling { total } else { ceiling };
        let budget = usize::try_from(budget).unwrap_or(usize::MAX);
        let workers = workers.min(budget);
        if workers == 0 {
            return Self {
                batch_size: 0,
                workers: 0,
            };
        }
        Self {
            batch_size: budget / workers,
            workers,
        }
    }
}

/// Outcome of one pass of the worker pool.
#[derive(Debug, Default)]
pub struct RunReport {
    /// 1 for the first run, incremented by every retry.
    pub pass: u32,
    pub plan: Option<BatchPlan>,
    pub workers: Vec<WorkerStats>,
    /// Store failures of workers, only filled under
    /// [`StoreErrorPolicy::FinishOthers`].
    pub errors: Vec<WorkerError>,
    /// Messages pending or failed once the pass finished.
    pub not_dispatched: u64,
    /// Messages failed once the pass finished.
    pub failed: u64,
}

impl RunReport {
    /// Messages delivered during this pass.
    pub fn delivered(&self) -> u64 {
        self.workers.iter().map(|w| w.delivered).sum()
    }

    /// Messages rejected during this pass.
    pub fn rejected(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }

    /// Whether any worker stopped because it could not connect.
    pub fn connect_failed(&self) -> bool {
        self.workers.iter().any(|w| w.connect_failed)
    }

    /// Whether any worker stopped because its session was lost.
    pub fn session_lost(&self) -> bool {
        self.workers.iter().any(|w| w.session_lost)
    }
}

/// Runs pools of dispatch workers.
///
/// Generic parameters:
/// - `D`: Store backend
/// - `C`: Transport connector
/// - `HK`: Hook implementation for worker lifecycle events
pub struct Coordinator<D, C, HK = DefaultDispatchHook> {
    store: Store<D>,
    connector: C,
    config: DispatchConfig,
    hook: Arc<HK>,
}

impl<D, C> Coordinator<D, C, DefaultDispatchHook> {
    /// Create a new coordinator with the default hook implementation.
    pub fn new(store: Store<D>, connector: C, config: DispatchConfig) -> Self {
        Self {
            store,
            connector,
            config,
            hook: Arc::new(DefaultDispatchHook),
        }
    }
}

impl<D, C, HK> Coordinator<D, C, HK>
where
    D: MessageStore + Clone + 'static,
    C: Connector + Clone + 'static,
    HK: DispatchHook + 'static,
{
    /// Replace the hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook>(self, hook: HK2) -> Coordinator<D, C, HK2> {
        Coordinator {
            store: self.store,
            connector: self.connector,
            config: self.config,
            hook: Arc::new(hook),
        }
    }

    pub fn store(&self) -> &Store<D> {
        &self.store
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Plan a run according to the configured memory ceiling.
    pub fn plan(&self, total: u64, workers: usize) -> BatchPlan {
        BatchPlan::new(total, workers, self.config.ceiling())
    }

    /// Run `workers` workers over `total` messages until none is pending.
    ///
    /// Blocks until every worker is done, then counts what is left
    /// undispatched. `total` only sizes the batches; each worker keeps
    /// claiming until the store has no pending message, its connect fails or
    /// its session is lost.
    pub async fn run(&self, total: u64, workers: usize) -> Result<RunReport, DispatchError> {
        self.run_pass(total, workers, 1).await
    }

    /// Run the pool, then retry while messages remain undispatched.
    ///
    /// After every pass with undispatched messages, `decide` is asked whether
    /// to go again; at most [`DispatchConfig::max_retry_passes`] retries run.
    /// Failed messages are only retried when
    /// [`DispatchConfig::requeue_failed`] is set. Returns the report of the
    /// last pass.
    pub async fn run_with_retry<F>(
        &self,
        total: u64,
        workers: usize,
        mut decide: F,
    ) -> Result<RunReport, DispatchError>
    where
        F: FnMut(&RunReport) -> bool,
    {
        let mut report = self.run_pass(total, workers, 1).await?;

        while report.not_dispatched > 0
            && report.pass <= self.config.max_retry_passes
            && decide(&report)
        {
            if self.config.requeue_failed {
                let requeued = self.store.requeue_failed().await?;
                tracing::info!(requeued, "Failed messages requeued");
            }
            let retryable = self.store.count_by_state(DeliveryState::Pending).await?;
            if retryable == 0 {
                tracing::info!(
                    failed = report.failed,
                    "Only failed messages left, nothing to retry"
                );
                break;
            }
            report = self.run_pass(retryable, workers, report.pass + 1).await?;
        }

        Ok(report)
    }

    #[tracing::instrument(skip(self))]
    async fn run_pass(
        &self,
        total: u64,
        workers: usize,
        pass: u32,
    ) -> Result<RunReport, DispatchError> {
        if workers == 0 {
            return Err(DispatchError::no_workers());
        }
        let plan = self.plan(total, workers);
        tracing::info!(?plan, "Sending messages");

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for id in 1..=plan.workers {
            let worker = Worker::new(
                id,
                self.store.clone(),
                self.connector.clone(),
                self.config.credentials.clone(),
                plan.batch_size,
                Arc::clone(&self.hook),
            )
            .with_cancellation(cancel.clone());
            tasks.spawn(worker.run());
        }

        let mut report = RunReport {
            pass,
            plan: Some(plan),
            ..RunReport::default()
        };
        let mut fatal = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(stats)) => report.workers.push(stats),
                Ok(Err(error)) => match self.config.store_error_policy {
                    StoreErrorPolicy::FinishOthers => report.errors.push(error),
                    StoreErrorPolicy::Abort => {
                        cancel.cancel();
                        fatal.get_or_insert(DispatchError::worker(error));
                    }
                },
                Err(error) => {
                    cancel.cancel();
                    fatal.get_or_insert(DispatchError::panicked(error));
                }
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }

        report.workers.sort_by_key(|w| w.worker);
        report.not_dispatched = self.store.count_not_dispatched().await?;
        report.failed = self.store.count_by_state(DeliveryState::Failed).await?;
        tracing::info!(
            pass,
            delivered = report.delivered(),
            not_dispatched = report.not_dispatched,
            "Pass finished"
        );
        Ok(report)
    }
}

/// Error returned when a dispatch run fails.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Classification of dispatch run errors.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// A worker stopped on a store failure.
    Worker(WorkerError),
    /// A store operation of the coordinator itself failed.
    Store(StoreError),
    /// A worker task panicked or was aborted.
    Panicked(JoinError),
    /// The run was asked to use zero workers.
    NoWorkers,
}

impl DispatchError {
    fn worker(error: WorkerError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Worker(error),
        }
    }

    fn panicked(error: JoinError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Panicked(error),
        }
    }

    fn no_workers() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::NoWorkers,
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Store(error),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Worker(err) => writeln!(f, "Worker error: {err}"),
            DispatchErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            DispatchErrorKind::Panicked(err) => writeln!(f, "Worker task failed: {err}"),
            DispatchErrorKind::NoWorkers => writeln!(f, "At least one worker is required"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Worker(err) => Some(err),
            DispatchErrorKind::Store(err) => Some(err),
            DispatchErrorKind::Panicked(err) => Some(err),
            DispatchErrorKind::NoWorkers => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        Batch, Credentials, InMemoryConnector, InMemoryStore, Message, MessageId, NewMessage,
        SendReport, store::InMemoryStoreError,
    };

    async fn populated(count: usize) -> Store<InMemoryStore> {
        let store = Store::new(InMemoryStore::new());
        let msgs = (1..=count)
            .map(|i| {
                NewMessage::new(
                    "sender@localhost",
                    format!("recipient{i}@localhost"),
                    format!("Subject {i}"),
                    format!("Body {i}"),
                )
            })
            .collect();
        store.insert_messages(msgs).await.unwrap();
        store
    }

    fn config() -> DispatchConfig {
        DispatchConfig::new(Credentials::new("user", "pass"))
    }

    #[test]
    fn plan_splits_total_below_ceiling() {
        assert_eq!(
            BatchPlan::new(100, 4, 10_000),
            BatchPlan {
                batch_size: 25,
                workers: 4
            }
        );
    }

    #[test]
    fn plan_splits_ceiling_above_it() {
        assert_eq!(
            BatchPlan::new(1_000_000, 8, 10_000),
            BatchPlan {
                batch_size: 1_250,
                workers: 8
            }
        );
        assert_eq!(BatchPlan::new(10_000, 3, 10_000).batch_size, 3_333);
    }

    #[test]
    fn plan_never_spawns_idle_workers() {
        assert_eq!(
            BatchPlan::new(3, 5, 10_000),
            BatchPlan {
                batch_size: 1,
                workers: 3
            }
        );
        assert_eq!(BatchPlan::new(0, 5, 10_000).workers, 0);
    }

    #[test]
    fn plan_bounds_messages_in_memory() {
        for total in [0, 1, 7, 99, 9_999, 10_000, 10_001, 123_456] {
            for workers in 1..=40 {
                let plan = BatchPlan::new(total, workers, 10_000);
                let bound = total.max(10_000) as usize;
                assert!(plan.batch_size * plan.workers <= bound);
                assert!(plan.workers <= workers);
                if total >= workers as u64 {
                    assert_eq!(plan.workers, workers);
                    assert!(plan.batch_size >= 1);
                }
            }
        }
    }

    #[tokio::test]
    async fn single_worker_with_rejections() {
        let store = populated(5).await;
        let connector = InMemoryConnector::new().reject_ids([2, 4]);
        let coordinator = Coordinator::new(store.clone(), connector, config());

        let report = coordinator.run(5, 1).await.unwrap();

        let driver = store.driver();
        assert_eq!(driver.ids_in_state(DeliveryState::Dispatched).await, vec![1, 3, 5]);
        assert_eq!(driver.ids_in_state(DeliveryState::Failed).await, vec![2, 4]);
        assert_eq!(report.not_dispatched, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered(), 3);
    }

    #[tokio::test]
    async fn single_worker_losing_the_session_mid_batch() {
        let store = populated(10).await;
        let connector = InMemoryConnector::new().drop_session_at(7);
        let coordinator = Coordinator::new(store.clone(), connector.clone(), config());

        let report = coordinator.run(10, 1).await.unwrap();

        let driver = store.driver();
        assert_eq!(
            driver.ids_in_state(DeliveryState::Dispatched).await,
            vec![1, 2, 3, 4, 5, 6]
        );
        assert_eq!(driver.ids_in_state(DeliveryState::Pending).await, vec![7, 8, 9, 10]);
        assert_eq!(report.not_dispatched, 4);
        assert!(report.session_lost());
        assert_eq!(report.workers[0].requeued, 4);
        assert_eq!(report.workers[0].batches, 1);
        assert_eq!(connector.delivered_ids().await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn lost_session_after_a_rejection() {
        let store = populated(10).await;
        let connector = InMemoryConnector::new()
            .reject_ids([6])
            .drop_session_at(7);
        let coordinator = Coordinator::new(store.clone(), connector, config());

        let report = coordinator.run(10, 1).await.unwrap();

        let driver = store.driver();
        assert_eq!(driver.ids_in_state(DeliveryState::Failed).await, vec![6]);
        assert_eq!(driver.ids_in_state(DeliveryState::Pending).await, vec![7, 8, 9, 10]);
        assert_eq!(report.not_dispatched, 5);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn session_dropping_message_does_not_stall_the_run() {
        let store = populated(5).await;
        let connector = InMemoryConnector::new().always_drop_session_at(3);
        let coordinator = Coordinator::new(store.clone(), connector.clone(), config());

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            coordinator.run(5, 1),
        )
        .await
        .expect("run did not return")
        .unwrap();

        assert_eq!(report.not_dispatched, 3);
        assert_eq!(connector.connections().await, 1);
    }

    #[tokio::test]
    async fn retries_of_a_session_dropping_message_are_bounded() {
        let store = populated(5).await;
        let connector = InMemoryConnector::new().always_drop_session_at(3);
        let coordinator = Coordinator::new(
            store.clone(),
            connector.clone(),
            config().with_max_retry_passes(2),
        );

        let report = coordinator.run_with_retry(5, 1, |_| true).await.unwrap();

        // One session per pass: the first run plus two retries.
        assert_eq!(report.pass, 3);
        assert_eq!(report.not_dispatched, 3);
        assert_eq!(connector.connections().await, 3);
        assert_eq!(connector.delivered_ids().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn retry_pass_resumes_after_a_lost_session() {
        let store = populated(10).await;
        let connector = InMemoryConnector::new().drop_session_at(7);
        let coordinator = Coordinator::new(store.clone(), connector.clone(), config());

        let report = coordinator.run_with_retry(10, 1, |_| true).await.unwrap();

        assert_eq!(report.pass, 2);
        assert_eq!(report.not_dispatched, 0);
        assert_eq!(connector.delivered_ids().await, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_delivers_every_message_once() {
        let store = populated(2_000).await;
        let connector = InMemoryConnector::new().reject_recipient("recipient10@localhost");
        let coordinator = Coordinator::new(store.clone(), connector.clone(), config());

        let report = coordinator.run(2_000, 8).await.unwrap();

        let mut delivered = connector.delivered_ids().await;
        delivered.sort_unstable();
        let expected: Vec<MessageId> = (1..=2_000).filter(|id| *id != 10).collect();
        assert_eq!(delivered, expected);
        assert_eq!(report.plan.unwrap().batch_size, 250);
        assert_eq!(report.workers.len(), 8);
        assert_eq!(report.delivered(), 1_999);
        assert_eq!(report.not_dispatched, 1);
    }

    #[tokio::test]
    async fn zero_workers_is_an_error() {
        let store = populated(1).await;
        let coordinator = Coordinator::new(store, InMemoryConnector::new(), config());

        let error = coordinator.run(1, 0).await.unwrap_err();

        assert!(matches!(error.kind(), DispatchErrorKind::NoWorkers));
    }

    #[tokio::test]
    async fn refused_connections_leave_everything_pending() {
        let store = populated(8).await;
        let connector = InMemoryConnector::new().refuse_connections();
        let coordinator = Coordinator::new(store.clone(), connector, config());

        let report = coordinator.run(8, 2).await.unwrap();

        assert!(report.connect_failed());
        assert_eq!(report.not_dispatched, 8);
        assert_eq!(store.count_by_state(DeliveryState::Pending).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn retry_pass_picks_up_requeued_messages() {
        let store = populated(6).await;
        let connector = InMemoryConnector::new().refuse_first_connections(1);
        let coordinator = Coordinator::new(store.clone(), connector, config());
        let mut asked = Vec::new();

        let report = coordinator
            .run_with_retry(6, 1, |report| {
                asked.push(report.not_dispatched);
                true
            })
            .await
            .unwrap();

        assert_eq!(asked, vec![6]);
        assert_eq!(report.pass, 2);
        assert_eq!(report.not_dispatched, 0);
    }

    #[tokio::test]
    async fn failed_messages_are_terminal_unless_requeued() {
        let store = populated(4).await;
        let connector = InMemoryConnector::new().reject_ids([3]);
        let coordinator = Coordinator::new(store.clone(), connector, config());

        let report = coordinator.run_with_retry(4, 2, |_| true).await.unwrap();

        assert_eq!(report.pass, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.driver().ids_in_state(DeliveryState::Failed).await, vec![3]);
    }

    #[tokio::test]
    async fn requeued_failures_are_retried_up_to_the_bound() {
        let store = populated(4).await;
        let connector = InMemoryConnector::new().reject_ids([3]);
        let coordinator = Coordinator::new(
            store.clone(),
            connector,
            config().with_requeue_failed(true).with_max_retry_passes(2),
        );
        let mut decisions = 0;

        let report = coordinator
            .run_with_retry(4, 1, |_| {
                decisions += 1;
                true
            })
            .await
            .unwrap();

        assert_eq!(decisions, 2);
        assert_eq!(report.pass, 3);
        assert_eq!(report.not_dispatched, 1);
    }

    #[tokio::test]
    async fn declined_retry_returns_first_report() {
        let store = populated(3).await;
        let connector = InMemoryConnector::new().refuse_connections();
        let coordinator = Coordinator::new(store, connector, config());

        let report = coordinator.run_with_retry(3, 1, |_| false).await.unwrap();

        assert_eq!(report.pass, 1);
        assert_eq!(report.not_dispatched, 3);
    }

    /// Store whose range and id updates fail once claims have started.
    #[derive(Clone)]
    struct BrokenUpdates {
        inner: InMemoryStore,
        claims: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct Unavailable;

    impl std::fmt::Display for Unavailable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("store unavailable")
        }
    }

    impl std::error::Error for Unavailable {}

    fn backend(err: InMemoryStoreError) -> tower::BoxError {
        Box::new(err)
    }

    #[async_trait::async_trait]
    impl MessageStore for BrokenUpdates {
        type Error = tower::BoxError;

        async fn claim_batch(&self, limit: usize) -> Result<Vec<Message>, Self::Error> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.inner.claim_batch(limit).await.map_err(backend)
        }

        async fn set_state_range(
            &self,
            _low: MessageId,
            _high: MessageId,
            _state: DeliveryState,
        ) -> Result<u64, Self::Error> {
            Err(Box::new(Unavailable))
        }

        async fn set_state_ids(
            &self,
            _ids: &[MessageId],
            _state: DeliveryState,
        ) -> Result<u64, Self::Error> {
            Err(Box::new(Unavailable))
        }

        async fn count_not_dispatched(&self) -> Result<u64, Self::Error> {
            self.inner.count_not_dispatched().await.map_err(backend)
        }

        async fn count_by_state(&self, state: DeliveryState) -> Result<u64, Self::Error> {
            self.inner.count_by_state(state).await.map_err(backend)
        }

        async fn requeue_failed(&self) -> Result<u64, Self::Error> {
            self.inner.requeue_failed().await.map_err(backend)
        }
    }

    #[tokio::test]
    async fn store_failure_aborts_the_run() {
        let inner = populated(20).await.driver().clone();
        let store = Store::new(BrokenUpdates {
            inner,
            claims: Arc::new(AtomicUsize::new(0)),
        });
        let connector = InMemoryConnector::new().reject_ids([1]);
        let coordinator = Coordinator::new(store.clone(), connector, config());

        let error = coordinator.run(20, 1).await.unwrap_err();

        match error.kind() {
            DispatchErrorKind::Worker(err) => {
                assert_eq!(err.worker(), 1);
                assert_eq!(err.range(), Some((1, 20)));
                assert_eq!(err.store_error().operation(), "set_state_ids");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.driver().claims.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_others_policy_collects_errors() {
        let inner = populated(4).await.driver().clone();
        let store = Store::new(BrokenUpdates {
            inner,
            claims: Arc::new(AtomicUsize::new(0)),
        });
        let connector = InMemoryConnector::new().reject_ids([2]);
        let coordinator = Coordinator::new(
            store,
            connector,
            config().with_store_error_policy(StoreErrorPolicy::FinishOthers),
        );

        let report = coordinator.run(4, 2).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.workers.len(), 1);
    }

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<String>>,
    }

    impl DispatchHook for RecordingHook {
        fn on_worker_started(&self, worker: usize) {
            self.events.lock().unwrap().push(format!("start {worker}"));
        }

        fn on_batch_claimed(&self, worker: usize, batch: &Batch) {
            self.events
                .lock()
                .unwrap()
                .push(format!("claim {worker} {:?}", batch.range()));
        }

        fn on_connect_error(&self, worker: usize, _batch: &Batch, _error: &dyn std::error::Error) {
            self.events.lock().unwrap().push(format!("connect {worker}"));
        }

        fn on_batch_sent(&self, worker: usize, _batch: &Batch, report: &SendReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("sent {worker} {}", report.delivered.len()));
        }

        fn on_store_error(&self, worker: usize, _error: &dyn std::error::Error) {
            self.events.lock().unwrap().push(format!("store {worker}"));
        }

        fn on_worker_done(&self, worker: usize, _stats: &WorkerStats) {
            self.events.lock().unwrap().push(format!("done {worker}"));
        }
    }

    #[tokio::test]
    async fn hook_observes_worker_lifecycle() {
        let store = populated(3).await;
        let coordinator = Coordinator::new(store, InMemoryConnector::new(), config())
            .with_hook(RecordingHook::default());

        coordinator.run(3, 1).await.unwrap();

        let events = coordinator.hook.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start 1".to_string(),
                "claim 1 Some((1, 3))".to_string(),
                "sent 1 3".to_string(),
                "done 1".to_string(),
            ]
        );
    }
}
