//! Queue poll dispatcher.
//!
//! One sequential loop per dispatcher. Each iteration first receives a batch
//! for every subscribed function in registration order, then invokes the
//! handlers and deletes the messages of every batch that succeeded. Messages
//! a handler sends while it runs are therefore only seen by a later
//! iteration.
//!
//! Received batches stay in flight until their handler runs, so once a batch
//! is held the remaining receives of the iteration only wait for half of its
//! visibility timeout. A message that still comes back within the same
//! iteration is not delivered twice.

use crate::config::{FunctionConfig, HarnessConfig, PollerConfig};
use crate::context::InvocationContext;
use crate::error::{EngineError, EngineResult, QueueError, RegistryResult};
use crate::event::QueueBatchEvent;
use crate::handler::QueueHandler;
use crate::queue::{MAX_VISIBILITY_TIMEOUT, QueueService, RawMessage};
use crate::registry::{QueueRegistry, QueueTrigger, Registration, Snapshot};
use crate::translate::{QueueSource, translate_queue_batch};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What happened to one function during one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The receive returned no messages.
    Empty,
    /// The handler succeeded.
    Delivered {
        /// Messages in the batch.
        records: usize,
        /// Messages deleted afterwards. Lower than `records` when some
        /// deletes failed; those messages will be delivered again.
        deleted: usize,
    },
    /// The queue does not exist.
    QueueNotFound,
    /// The queue service failed to receive.
    ReceiveFailed(String),
    /// The batch could not be translated. Messages are left on the queue.
    MalformedBatch(String),
    /// The handler failed or panicked. Messages are left on the queue.
    HandlerFailed {
        /// Messages in the batch.
        records: usize,
        /// The handler's error or panic message.
        error: String,
    },
    /// The dispatcher was stopped before this function was polled.
    Skipped,
}

/// Per-function counters, accumulated across iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionStats {
    /// Receives attempted.
    pub polls: u64,
    /// Handler invocations.
    pub invocations: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    /// Messages acknowledged after a successful invocation.
    pub messages_deleted: u64,
}

/// Outcome of one iteration, in registration order.
pub type IterationReport = Vec<(String, PollOutcome)>;

struct PendingBatch {
    registration: Arc<Registration<QueueTrigger>>,
    queue_url: String,
    batch: QueueBatchEvent,
    /// Latest point at which the batch is still safely hidden on its queue.
    hold_until: Instant,
}

enum Received {
    Batch(PendingBatch),
    Done(PollOutcome),
}

/// Batches received so far in one iteration and not yet invoked.
#[derive(Default)]
struct Held {
    until: Option<Instant>,
    message_ids: HashSet<String>,
}

impl Held {
    /// Caps a receive wait so held batches are invoked before any of them
    /// can become visible again.
    fn cap_wait(&self, wait: Duration) -> Duration {
        self.until.map_or(wait, |until| {
            wait.min(until.saturating_duration_since(Instant::now()))
        })
    }

    fn hold(&mut self, pending: &PendingBatch) {
        self.until = Some(
            self.until
                .map_or(pending.hold_until, |until| until.min(pending.hold_until)),
        );
        self.message_ids.extend(
            pending
                .batch
                .records()
                .iter()
                .map(|record| record.message_id.clone()),
        );
    }

    fn contains(&self, message: &RawMessage) -> bool {
        message
            .message_id
            .as_ref()
            .is_some_and(|id| self.message_ids.contains(id))
    }
}

struct PollerInner {
    registry: QueueRegistry,
    queues: Arc<dyn QueueService>,
    poller: PollerConfig,
    function: FunctionConfig,
    stats: SyncMutex<HashMap<String, FunctionStats>>,
}

impl PollerInner {
    fn record(&self, name: &str, update: impl FnOnce(&mut FunctionStats)) {
        update(self.stats.lock().entry(name.to_string()).or_default());
    }

    async fn run_iteration(
        &self,
        snapshot: &Snapshot<QueueTrigger>,
        cancel: &CancellationToken,
    ) -> IterationReport {
        let mut report: Vec<(String, Option<PollOutcome>)> = Vec::with_capacity(snapshot.len());
        let mut pending = Vec::new();
        let mut held = Held::default();

        for registration in snapshot {
            let name = registration.name().to_string();
            if cancel.is_cancelled() {
                report.push((name, Some(PollOutcome::Skipped)));
                continue;
            }

            match self.receive(registration, &held, cancel).await {
                Received::Batch(batch) => {
                    held.hold(&batch);
                    pending.push((report.len(), batch));
                    report.push((name, None));
                }
                Received::Done(outcome) => report.push((name, Some(outcome))),
            }
        }

        for (slot, batch) in pending {
            let outcome = self.invoke(batch).await;
            report[slot].1 = Some(outcome);
        }

        report
            .into_iter()
            .map(|(name, outcome)| (name, outcome.unwrap_or(PollOutcome::Skipped)))
            .collect()
    }

    async fn receive(
        &self,
        registration: &Arc<Registration<QueueTrigger>>,
        held: &Held,
        cancel: &CancellationToken,
    ) -> Received {
        let name = registration.name();
        let trigger = registration.trigger();
        self.record(name, |stats| stats.polls += 1);

        let queue_url = match self.queues.get_queue_url(&trigger.queue_name).await {
            Ok(url) => url,
            Err(QueueError::QueueNotFound(queue)) => {
                tracing::warn!(function = %name, queue = %queue, "Queue not found");
                return Received::Done(PollOutcome::QueueNotFound);
            }
            Err(e) => {
                tracing::warn!(function = %name, queue = %trigger.queue_name, error = %e, "Failed to resolve queue");
                return Received::Done(PollOutcome::ReceiveFailed(e.to_string()));
            }
        };

        let started = Instant::now();
        let wait = held.cap_wait(trigger.wait);
        let received = tokio::select! {
            result = self.queues.receive_messages(&queue_url, trigger.batch_size, wait) => result,
            _ = cancel.cancelled() => return Received::Done(PollOutcome::Skipped),
        };

        let mut messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(function = %name, queue = %trigger.queue_name, error = %e, "Receive failed");
                return Received::Done(PollOutcome::ReceiveFailed(e.to_string()));
            }
        };

        let before = messages.len();
        messages.retain(|message| !held.contains(message));
        if messages.len() < before {
            tracing::warn!(
                function = %name,
                queue = %trigger.queue_name,
                count = before - messages.len(),
                "Messages already held by this iteration, leaving them for redelivery"
            );
        }

        if messages.is_empty() {
            tracing::debug!(function = %name, queue = %trigger.queue_name, "No messages");
            return Received::Done(PollOutcome::Empty);
        }

        let visibility = match self.queues.visibility_timeout(&queue_url).await {
            Ok(timeout) => timeout,
            Err(e) => {
                tracing::debug!(function = %name, error = %e, "Visibility timeout unknown");
                Duration::ZERO
            }
        };

        let source = QueueSource::new(&trigger.queue_name, &self.function);
        match translate_queue_batch(messages, &source) {
            Ok(batch) => Received::Batch(PendingBatch {
                registration: registration.clone(),
                queue_url,
                batch,
                hold_until: started + visibility.min(MAX_VISIBILITY_TIMEOUT) / 2,
            }),
            Err(e) => {
                tracing::warn!(function = %name, queue = %trigger.queue_name, error = %e, "Dropping malformed batch");
                Received::Done(PollOutcome::MalformedBatch(e.to_string()))
            }
        }
    }

    async fn invoke(&self, pending: PendingBatch) -> PollOutcome {
        let PendingBatch {
            registration,
            queue_url,
            batch,
            ..
        } = pending;
        let name = registration.name();
        let queue = &registration.trigger().queue_name;
        let records = batch.len();
        let receipts: Vec<String> = batch
            .records()
            .iter()
            .map(|record| record.receipt_handle.clone())
            .collect();

        let context = InvocationContext::new(name, &self.function);
        let request_id = context.aws_request_id.clone();
        self.record(name, |stats| stats.invocations += 1);
        tracing::debug!(function = %name, queue = %queue, records, request_id = %request_id, "Invoking handler");

        if let Err(failure) = registration.handler().invoke(batch, context).await {
            self.record(name, |stats| stats.failures += 1);
            tracing::error!(
                function = %name,
                queue = %queue,
                records,
                request_id = %request_id,
                error = %failure,
                "Handler failed, messages left on queue"
            );
            return PollOutcome::HandlerFailed {
                records,
                error: failure.to_string(),
            };
        }

        let mut deleted = 0;
        for receipt in &receipts {
            match self.queues.delete_message(&queue_url, receipt).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(function = %name, queue = %queue, error = %e, "Failed to delete message");
                }
            }
        }
        self.record(name, |stats| stats.messages_deleted += deleted as u64);

        PollOutcome::Delivered { records, deleted }
    }

    async fn run(
        self: Arc<Self>,
        snapshot: Snapshot<QueueTrigger>,
        cancel: CancellationToken,
        ready: oneshot::Sender<()>,
    ) {
        tracing::info!(
            target: "lambda_harness",
            functions = snapshot.len(),
            interval_ms = self.poller.interval.as_millis() as u64,
            "Queue poll dispatcher started"
        );
        let _ = ready.send(());

        while !cancel.is_cancelled() {
            self.run_iteration(&snapshot, &cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poller.interval) => {}
            }
        }

        tracing::info!(target: "lambda_harness", "Queue poll dispatcher stopped");
    }
}

struct RunningPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls queues and invokes the subscribed handlers.
///
/// # Examples
///
/// ```no_run
/// use lambda_harness::config::HarnessConfig;
/// use lambda_harness::handler::QueueHandler;
/// use lambda_harness::poller::QueuePollDispatcher;
/// use lambda_harness::queue::{InMemoryQueueService, QueueService};
/// use lambda_harness::registry::QueueTrigger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = HarnessConfig::default();
/// let queues = InMemoryQueueService::new_shared(config.queue.clone());
/// queues.create_queue("orders").await?;
///
/// let dispatcher = QueuePollDispatcher::new(&config, queues.clone());
/// dispatcher.register(
///     "process-orders",
///     QueueTrigger::new("orders").batch_size(10),
///     QueueHandler::new(|batch, _context| async move {
///         for record in batch.records() {
///             println!("{}", record.body);
///         }
///         Ok(())
///     }),
/// )?;
///
/// dispatcher.start().await?;
/// dispatcher.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct QueuePollDispatcher {
    inner: Arc<PollerInner>,
    running: Mutex<Option<RunningPoller>>,
}

impl QueuePollDispatcher {
    /// Creates a stopped dispatcher from the harness configuration.
    pub fn new(config: &HarnessConfig, queues: Arc<dyn QueueService>) -> Self {
        Self::with_config(config.poller.clone(), config.function.clone(), queues)
    }

    /// Creates a stopped dispatcher from its individual configuration sections.
    pub fn with_config(
        poller: PollerConfig,
        function: FunctionConfig,
        queues: Arc<dyn QueueService>,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                registry: QueueRegistry::new(),
                queues,
                poller,
                function,
                stats: SyncMutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Subscribes `handler` to a queue under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`](crate::error::RegistryError::DuplicateName)
    /// if the name is taken, or `InvalidTrigger` for an empty queue name or a
    /// zero batch size.
    pub fn register(
        &self,
        name: impl Into<String>,
        trigger: QueueTrigger,
        handler: QueueHandler,
    ) -> RegistryResult<()> {
        self.inner
            .registry
            .register(Registration::new(name, trigger, handler))
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`](crate::error::RegistryError::NotFound)
    /// for unknown names.
    pub fn unregister(&self, name: &str) -> RegistryResult<()> {
        self.inner.registry.unregister(name).map(|_| ())
    }

    /// The dispatcher's registry.
    pub fn registry(&self) -> &QueueRegistry {
        &self.inner.registry
    }

    /// Counters for one function, if it has been polled at least once.
    pub fn stats(&self, name: &str) -> Option<FunctionStats> {
        self.inner.stats.lock().get(name).copied()
    }

    /// Runs a single iteration over the current registrations.
    ///
    /// Useful for driving the dispatcher by hand in tests. Can run while the
    /// background loop is also running.
    pub async fn poll_once(&self) -> IterationReport {
        let snapshot = self.inner.registry.list();
        self.inner
            .run_iteration(&snapshot, &CancellationToken::new())
            .await
    }

    /// Returns `true` while the background loop is running.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|poller| !poller.handle.is_finished())
    }

    /// Snapshots the registry and spawns the poll loop. Returns once the
    /// loop is running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if the loop is running.
    pub async fn start(&self) -> EngineResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::AlreadyRunning("Queue poll dispatcher"));
        }

        let snapshot = self.inner.registry.list();
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(self.inner.clone().run(snapshot, cancel.clone(), ready_tx));

        if ready_rx.await.is_err() {
            return Err(EngineError::ServerStart(
                "queue poll loop exited before starting".to_string(),
            ));
        }

        *running = Some(RunningPoller { cancel, handle });
        Ok(())
    }

    /// Signals the loop to stop and waits for it. A handler that is already
    /// running finishes first. Does nothing if the loop is not running.
    pub async fn stop(&self) {
        let Some(poller) = self.running.lock().await.take() else {
            return;
        };

        poller.cancel.cancel();
        if let Err(e) = poller.handle.await {
            tracing::warn!(error = %e, "Queue poll loop task failed");
        }
    }
}

impl std::fmt::Debug for QueuePollDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePollDispatcher")
            .field("interval", &self.inner.poller.interval)
            .field("functions", &self.inner.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::InMemoryQueueService;

    fn setup() -> (Arc<InMemoryQueueService>, QueuePollDispatcher) {
        let queues = InMemoryQueueService::new_shared(QueueConfig::default());
        let dispatcher = QueuePollDispatcher::with_config(
            PollerConfig {
                interval: Duration::from_millis(10),
            },
            FunctionConfig::default(),
            queues.clone(),
        );
        (queues, dispatcher)
    }

    fn noop() -> QueueHandler {
        QueueHandler::new(|_batch, _context| async { Ok(()) })
    }

    #[tokio::test]
    async fn empty_queue_reports_empty() {
        let (queues, dispatcher) = setup();
        queues.create_queue("q").await.unwrap();
        dispatcher.register("f", QueueTrigger::new("q"), noop()).unwrap();

        let report = dispatcher.poll_once().await;

        assert_eq!(report, vec![("f".to_string(), PollOutcome::Empty)]);
        assert_eq!(dispatcher.stats("f").unwrap().polls, 1);
        assert_eq!(dispatcher.stats("f").unwrap().invocations, 0);
    }

    #[tokio::test]
    async fn missing_queue_does_not_stop_iteration() {
        let (queues, dispatcher) = setup();
        let url = queues.create_queue("present").await.unwrap();
        queues.send_message(&url, "x").await.unwrap();
        dispatcher.register("a", QueueTrigger::new("absent"), noop()).unwrap();
        dispatcher.register("b", QueueTrigger::new("present"), noop()).unwrap();

        let report = dispatcher.poll_once().await;

        assert_eq!(report[0], ("a".to_string(), PollOutcome::QueueNotFound));
        assert_eq!(
            report[1],
            (
                "b".to_string(),
                PollOutcome::Delivered {
                    records: 1,
                    deleted: 1
                }
            )
        );
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_is_idempotent() {
        let (_queues, dispatcher) = setup();

        dispatcher.start().await.unwrap();
        assert!(dispatcher.is_running().await);
        assert!(matches!(
            dispatcher.start().await,
            Err(EngineError::AlreadyRunning(_))
        ));

        dispatcher.stop().await;
        dispatcher.stop().await;
        assert!(!dispatcher.is_running().await);
    }

    #[tokio::test]
    async fn stop_interrupts_long_poll() {
        let (queues, dispatcher) = setup();
        queues.create_queue("q").await.unwrap();
        dispatcher
            .register("f", QueueTrigger::new("q").wait(Duration::from_secs(30)), noop())
            .unwrap();

        dispatcher.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), dispatcher.stop())
            .await
            .expect("stop should not wait for the long poll to finish");
    }
}
