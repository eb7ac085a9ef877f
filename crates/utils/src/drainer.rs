//! The adaptive queue drainer.
//!
//! A drain sizes a pool of workers from the queue backlog, each worker runs
//! a fixed number of receive iterations and every received item is
//! delivered and then deleted. Items are only deleted after the transport
//! accepted them, anything else is left to reappear once its visibility
//! timeout expires.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures_util::{future::join_all, FutureExt};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    delivery::DeliveryTransport,
    queue::{MessageQueue, QueueError, ReceiveOptions, ReceivedItem},
    split_message,
    storage::{content_key, ContentStore},
    QueuedMessage,
};

/// Errors that abort a whole drain invocation.
#[derive(Debug, Error)]
pub enum DrainerError {
    /// The queue backlog could not be measured.
    #[error("Failed to query queue backlog: {0}")]
    Backlog(#[from] QueueError),
}

/// Sizing and polling parameters of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Backlog items per worker.
    pub backlog_divisor: usize,

    /// Upper bound on concurrent workers.
    pub max_concurrency: usize,

    /// Sequential receive iterations run by every worker.
    pub iterations: usize,

    pub receive: ReceiveOptions,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            backlog_divisor: 40,
            max_concurrency: 14,
            iterations: 8,
            receive: ReceiveOptions::default(),
        }
    }
}

impl DrainPolicy {
    /// Computes the worker pool for a backlog, one worker per
    /// `backlog_divisor` items (rounded to nearest), at least one and at
    /// most `max_concurrency`.
    pub fn plan(&self, backlog: usize) -> WorkerPoolPlan {
        let divisor = self.backlog_divisor.max(1);
        let rounded = backlog.saturating_add(divisor / 2) / divisor;
        WorkerPoolPlan {
            backlog_estimate: backlog,
            concurrency: rounded.clamp(1, self.max_concurrency.max(1)),
        }
    }
}

/// Worker pool size chosen for one drain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPoolPlan {
    pub backlog_estimate: usize,
    pub concurrency: usize,
}

/// Result of processing a single queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Delivered and removed from the queue.
    Delivered,
    /// The payload is not a queued message.
    Malformed,
    /// The message body could not be read from the content store.
    FetchFailed,
    /// The transport did not accept the message.
    DeliveryFailed,
    /// Delivered, but the receipt was no longer valid for deletion.
    DeleteFailed,
}

/// Result of one receive iteration of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IterationOutcome {
    /// The receive call returned no items.
    Empty,
    Processed {
        received: usize,
        delivered: usize,
        failed: usize,
    },
}

/// Per-worker result of a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub iterations: Vec<IterationOutcome>,

    /// Set when the worker stopped early, after a failed receive or a panic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerSummary {
    pub fn delivered(&self) -> usize {
        self.iterations
            .iter()
            .map(|iteration| match iteration {
                IterationOutcome::Processed { delivered, .. } => *delivered,
                IterationOutcome::Empty => 0,
            })
            .sum()
    }
}

/// Result of a full drain invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub plan: WorkerPoolPlan,

    /// Worker summaries ordered by worker index.
    pub workers: Vec<WorkerSummary>,
}

impl DrainReport {
    pub fn delivered(&self) -> usize {
        self.workers.iter().map(WorkerSummary::delivered).sum()
    }
}

/// Drains the forwarding queue into the delivery transport.
pub struct Drainer {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ContentStore>,
    transport: Arc<dyn DeliveryTransport>,
    key_prefix: String,
    policy: DrainPolicy,
}

impl Drainer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ContentStore>,
        transport: Arc<dyn DeliveryTransport>,
        key_prefix: String,
        policy: DrainPolicy,
    ) -> Self {
        info!(
            queue = queue.name(),
            store = store.name(),
            transport = transport.name(),
            "Drainer initialized"
        );
        Self {
            queue,
            store,
            transport,
            key_prefix,
            policy,
        }
    }

    pub fn policy(&self) -> &DrainPolicy {
        &self.policy
    }

    /// Runs one drain invocation.
    ///
    /// Workers run fully in parallel, a failing worker never stops its
    /// siblings. Only a failure to measure the backlog aborts the drain.
    pub async fn drain(self: &Arc<Self>) -> Result<DrainReport, DrainerError> {
        let backlog = self.queue.approximate_backlog().await.map_err(|e| {
            error!(queue = self.queue.name(), error = %e, "Failed to query queue backlog");
            DrainerError::Backlog(e)
        })?;
        let plan = self.policy.plan(backlog);
        info!(
            backlog = plan.backlog_estimate,
            concurrency = plan.concurrency,
            "Launching drain workers"
        );

        let mut workers = JoinSet::new();
        for worker in 0..plan.concurrency {
            let drainer = Arc::clone(self);
            workers.spawn(async move {
                match AssertUnwindSafe(drainer.run_worker(worker)).catch_unwind().await {
                    Ok(summary) => summary,
                    Err(payload) => {
                        let reason = panic_reason(payload.as_ref());
                        error!(worker = worker, reason = %reason, "Drain worker panicked");
                        WorkerSummary {
                            worker,
                            iterations: Vec::new(),
                            error: Some(format!("Worker panicked: {reason}")),
                        }
                    }
                }
            });
        }

        let mut summaries = Vec::with_capacity(plan.concurrency);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(error = %e, "Drain worker task was cancelled"),
            }
        }
        summaries.sort_by_key(|summary| summary.worker);

        let report = DrainReport {
            plan,
            workers: summaries,
        };
        info!(delivered = report.delivered(), "Drain finished");
        Ok(report)
    }

    async fn run_worker(&self, worker: usize) -> WorkerSummary {
        let mut iterations = Vec::with_capacity(self.policy.iterations);

        for iteration in 0..self.policy.iterations {
            let items = match self.queue.receive(self.policy.receive).await {
                Ok(items) => items,
                Err(e) => {
                    error!(
                        worker = worker,
                        iteration = iteration,
                        error = %e,
                        "Receive failed, stopping worker"
                    );
                    return WorkerSummary {
                        worker,
                        iterations,
                        error: Some(e.to_string()),
                    };
                }
            };

            if items.is_empty() {
                debug!(worker = worker, iteration = iteration, "Queue seems to be empty");
                iterations.push(IterationOutcome::Empty);
                continue;
            }

            info!(
                worker = worker,
                iteration = iteration,
                count = items.len(),
                "Jobs received from the queue"
            );
            let pending: Vec<_> = items.iter().map(|item| self.process(item)).collect();
            let outcomes = join_all(pending).await;
            let delivered = outcomes
                .iter()
                .filter(|outcome| **outcome == ItemOutcome::Delivered)
                .count();
            iterations.push(IterationOutcome::Processed {
                received: items.len(),
                delivered,
                failed: items.len() - delivered,
            });
        }

        WorkerSummary {
            worker,
            iterations,
            error: None,
        }
    }

    /// Processes a single received item, deleting it only after delivery.
    pub async fn process(&self, item: &ReceivedItem) -> ItemOutcome {
        let queued = match QueuedMessage::from_json(&item.body) {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "Skipping malformed queue item");
                return ItemOutcome::Malformed;
            }
        };

        let key = content_key(&self.key_prefix, &queued.message_id);
        let raw = match self.store.fetch(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    message_id = %queued.message_id,
                    key = %key,
                    error = %e,
                    "Failed to fetch message body"
                );
                return ItemOutcome::FetchFailed;
            }
        };
        let (_, body) = split_message(&raw);
        let message = queued.assemble(body);

        debug!(
            message_id = %queued.message_id,
            recipients = ?queued.recipients,
            "Sending forwarded message"
        );
        if let Err(e) = self
            .transport
            .send(
                message.as_bytes(),
                &queued.recipients,
                &queued.original_recipient,
            )
            .await
        {
            error!(
                message_id = %queued.message_id,
                recipients = ?queued.recipients,
                error = %e,
                "Email sending failed"
            );
            return ItemOutcome::DeliveryFailed;
        }

        match self.queue.delete(&item.receipt).await {
            Ok(()) => {
                info!(
                    message_id = %queued.message_id,
                    recipients = ?queued.recipients,
                    "Sent email successfully"
                );
                ItemOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    message_id = %queued.message_id,
                    error = %e,
                    "Sent email but failed to delete queue item"
                );
                ItemOutcome::DeleteFailed
            }
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{
        delivery::{DeliveryError, DeliveryFuture},
        queue::QueueFuture,
        queues::MemoryQueue,
        storage::MemoryContentStore,
    };

    /// Transport that records every send and optionally fails them all.
    #[derive(Default)]
    struct CountingTransport {
        fail: bool,
        sent: Mutex<Vec<(String, Vec<String>, String)>>,
    }

    impl DeliveryTransport for CountingTransport {
        fn send<'a>(
            &'a self,
            raw: &'a [u8],
            recipients: &'a [String],
            envelope_sender: &'a str,
        ) -> DeliveryFuture<'a> {
            Box::pin(async move {
                if self.fail {
                    return Err(DeliveryError::Transport("throttled".to_string()));
                }
                self.sent.lock().unwrap().push((
                    String::from_utf8_lossy(raw).into_owned(),
                    recipients.to_vec(),
                    envelope_sender.to_string(),
                ));
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    /// Queue wrapper counting delete calls and optionally failing receives.
    struct ObservedQueue {
        inner: MemoryQueue,
        backlog: Option<usize>,
        fail_receive: bool,
        panic_receive: AtomicBool,
        deletes: AtomicUsize,
    }

    impl ObservedQueue {
        fn new(inner: MemoryQueue) -> Self {
            Self {
                inner,
                backlog: None,
                fail_receive: false,
                panic_receive: AtomicBool::new(false),
                deletes: AtomicUsize::new(0),
            }
        }
    }

    impl MessageQueue for ObservedQueue {
        fn enqueue<'a>(&'a self, body: &'a str) -> QueueFuture<'a, String> {
            self.inner.enqueue(body)
        }

        fn approximate_backlog(&self) -> QueueFuture<'_, usize> {
            if let Some(backlog) = self.backlog {
                return Box::pin(async move { Ok(backlog) });
            }
            self.inner.approximate_backlog()
        }

        fn receive(&self, options: ReceiveOptions) -> QueueFuture<'_, Vec<ReceivedItem>> {
            if self.fail_receive {
                return Box::pin(async { Err(QueueError::Connection("down".to_string())) });
            }
            if self.panic_receive.swap(false, Ordering::SeqCst) {
                panic!("receive exploded");
            }
            self.inner.receive(options)
        }

        fn delete<'a>(&'a self, receipt: &'a str) -> QueueFuture<'a, ()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(receipt)
        }

        fn name(&self) -> &str {
            "observed"
        }
    }

    fn queued_json(message_id: &str) -> String {
        QueuedMessage {
            header: "From: Jane <no-reply@x.com>\r\nReply-To: Jane <jane@example.com>\r\n"
                .to_string(),
            message_id: message_id.to_string(),
            recipients: vec!["team@example.com".to_string()],
            original_recipient: "info@example.com".to_string(),
        }
        .to_json()
        .unwrap()
    }

    fn quick_policy(iterations: usize) -> DrainPolicy {
        DrainPolicy {
            iterations,
            receive: ReceiveOptions {
                wait: std::time::Duration::ZERO,
                ..ReceiveOptions::default()
            },
            ..DrainPolicy::default()
        }
    }

    fn store_with(message_ids: &[&str]) -> Arc<MemoryContentStore> {
        let store = Arc::new(MemoryContentStore::new());
        for id in message_ids {
            store
                .put(
                    &format!("emails/{id}"),
                    "From: Jane <jane@example.com>\r\nDKIM-Signature: x\r\n\r\nHello\r\n",
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_plan_concurrency() {
        let policy = DrainPolicy::default();
        assert_eq!(policy.plan(0).concurrency, 1);
        assert_eq!(policy.plan(19).concurrency, 1);
        assert_eq!(policy.plan(20).concurrency, 1);
        assert_eq!(policy.plan(60).concurrency, 2);
        assert_eq!(policy.plan(400).concurrency, 10);
        assert_eq!(policy.plan(10_000).concurrency, 14);
        assert_eq!(policy.plan(usize::MAX).concurrency, 14);
        assert_eq!(policy.plan(400).backlog_estimate, 400);
    }

    #[test]
    fn test_plan_with_custom_policy() {
        let policy = DrainPolicy {
            backlog_divisor: 10,
            max_concurrency: 3,
            ..DrainPolicy::default()
        };
        assert_eq!(policy.plan(14).concurrency, 1);
        assert_eq!(policy.plan(15).concurrency, 2);
        assert_eq!(policy.plan(1000).concurrency, 3);
    }

    #[tokio::test]
    async fn test_drain_delivers_and_deletes() {
        let queue = Arc::new(ObservedQueue::new(MemoryQueue::new()));
        for id in ["a", "b", "c"] {
            queue.enqueue(&queued_json(id)).await.unwrap();
        }
        let transport = Arc::new(CountingTransport::default());
        let drainer = Arc::new(Drainer::new(
            queue.clone(),
            store_with(&["a", "b", "c"]),
            transport.clone(),
            "emails/".to_string(),
            quick_policy(2),
        ));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.plan.concurrency, 1);
        assert_eq!(report.workers.len(), 1);
        assert_eq!(
            report.workers[0].iterations,
            vec![
                IterationOutcome::Processed {
                    received: 3,
                    delivered: 3,
                    failed: 0
                },
                IterationOutcome::Empty,
            ]
        );
        assert_eq!(report.delivered(), 3);
        assert_eq!(queue.deletes.load(Ordering::SeqCst), 3);
        assert!(queue.inner.snapshot().is_empty());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let (raw, recipients, sender) = &sent[0];
        assert_eq!(
            raw,
            "From: Jane <no-reply@x.com>\r\nReply-To: Jane <jane@example.com>\r\n\r\nHello\r\n"
        );
        assert_eq!(recipients, &vec!["team@example.com".to_string()]);
        assert_eq!(sender, "info@example.com");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_deleted() {
        let queue = Arc::new(ObservedQueue::new(MemoryQueue::new()));
        queue.enqueue(&queued_json("a")).await.unwrap();
        let drainer = Arc::new(Drainer::new(
            queue.clone(),
            store_with(&["a"]),
            Arc::new(CountingTransport {
                fail: true,
                ..Default::default()
            }),
            "emails/".to_string(),
            quick_policy(1),
        ));

        let report = drainer.drain().await.unwrap();
        assert_eq!(
            report.workers[0].iterations,
            vec![IterationOutcome::Processed {
                received: 1,
                delivered: 0,
                failed: 1
            }]
        );
        assert_eq!(queue.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(queue.inner.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_missing_body_and_malformed_items_are_kept() {
        let queue = Arc::new(ObservedQueue::new(MemoryQueue::new()));
        queue.enqueue(&queued_json("missing")).await.unwrap();
        queue.enqueue("not json").await.unwrap();
        let drainer = Drainer::new(
            queue.clone(),
            store_with(&[]),
            Arc::new(CountingTransport::default()),
            "emails/".to_string(),
            quick_policy(1),
        );

        let items = queue.receive(quick_policy(1).receive).await.unwrap();
        assert_eq!(drainer.process(&items[0]).await, ItemOutcome::FetchFailed);
        assert_eq!(drainer.process(&items[1]).await, ItemOutcome::Malformed);
        assert_eq!(queue.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_workers_run_all_iterations_on_empty_queue() {
        let mut observed = ObservedQueue::new(MemoryQueue::new());
        observed.backlog = Some(400);
        let drainer = Arc::new(Drainer::new(
            Arc::new(observed),
            store_with(&[]),
            Arc::new(CountingTransport::default()),
            "emails/".to_string(),
            quick_policy(8),
        ));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.plan.concurrency, 10);
        assert_eq!(report.workers.len(), 10);
        for (index, worker) in report.workers.iter().enumerate() {
            assert_eq!(worker.worker, index);
            assert_eq!(worker.iterations, vec![IterationOutcome::Empty; 8]);
            assert!(worker.error.is_none());
        }
    }

    #[tokio::test]
    async fn test_receive_failure_stops_worker() {
        let mut observed = ObservedQueue::new(MemoryQueue::new());
        observed.backlog = Some(80);
        observed.fail_receive = true;
        let drainer = Arc::new(Drainer::new(
            Arc::new(observed),
            store_with(&[]),
            Arc::new(CountingTransport::default()),
            "emails/".to_string(),
            quick_policy(8),
        ));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.workers.len(), 2);
        for worker in &report.workers {
            assert!(worker.iterations.is_empty());
            assert!(worker.error.as_deref().unwrap().contains("down"));
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_stop_siblings() {
        let mut observed = ObservedQueue::new(MemoryQueue::new());
        observed.backlog = Some(80);
        observed.panic_receive = AtomicBool::new(true);
        let drainer = Arc::new(Drainer::new(
            Arc::new(observed),
            store_with(&[]),
            Arc::new(CountingTransport::default()),
            "emails/".to_string(),
            quick_policy(3),
        ));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.workers[0].worker, 0);
        assert_eq!(report.workers[1].worker, 1);

        let (panicked, healthy): (Vec<_>, Vec<_>) =
            report.workers.iter().partition(|worker| worker.error.is_some());
        assert_eq!(panicked.len(), 1);
        assert!(panicked[0].iterations.is_empty());
        assert_eq!(
            panicked[0].error.as_deref(),
            Some("Worker panicked: receive exploded")
        );
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].iterations, vec![IterationOutcome::Empty; 3]);
    }

    #[tokio::test]
    async fn test_summary_json() {
        let summary = WorkerSummary {
            worker: 0,
            iterations: vec![
                IterationOutcome::Empty,
                IterationOutcome::Processed {
                    received: 2,
                    delivered: 1,
                    failed: 1,
                },
            ],
            error: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["iterations"][0]["status"], "empty");
        assert_eq!(json["iterations"][1]["status"], "processed");
        assert_eq!(json["iterations"][1]["delivered"], 1);
        assert!(json.get("error").is_none());
    }
}
