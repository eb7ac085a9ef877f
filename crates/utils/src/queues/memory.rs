use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{MessageQueue, QueueError, QueueFuture, ReceiveOptions, ReceivedItem};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    body: String,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Entry>,
    in_flight: HashMap<String, InFlight>,
}

impl State {
    /// Makes every in-flight item whose visibility window has passed
    /// receivable again, invalidating its receipt.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, item)| item.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(item) = self.in_flight.remove(&receipt) {
                debug!(id = %item.entry.id, "Visibility timeout expired, item requeued");
                self.pending.push_back(item.entry);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|item| item.deadline).min()
    }
}

/// In-process queue with visibility timeouts and long polling.
///
/// Useful for testing and for running the pipeline and the drainer inside
/// a single process.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    /// Creates a new empty [`MemoryQueue`].
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of items currently hidden by a visibility timeout.
    pub fn in_flight(&self) -> usize {
        let mut state = self.state();
        state.requeue_expired(Instant::now());
        state.in_flight.len()
    }

    /// Returns the bodies of every item still in the queue, visible or not.
    pub fn snapshot(&self) -> Vec<String> {
        let state = self.state();
        state
            .pending
            .iter()
            .chain(state.in_flight.values().map(|item| &item.entry))
            .map(|entry| entry.body.clone())
            .collect()
    }

    /// Pops up to `max` visible items, or returns the next instant an
    /// in-flight item could become visible again.
    fn take(&self, options: &ReceiveOptions) -> Result<Vec<ReceivedItem>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state();
        state.requeue_expired(now);

        let count = options.max_items.min(state.pending.len());
        if count == 0 {
            return Err(state.next_expiry());
        }

        let deadline = now + options.visibility_timeout;
        let mut items = Vec::with_capacity(count);
        for entry in state.pending.drain(..count).collect::<Vec<_>>() {
            let receipt = Uuid::new_v4().to_string();
            items.push(ReceivedItem {
                body: entry.body.clone(),
                receipt: receipt.clone(),
            });
            state.in_flight.insert(receipt, InFlight { entry, deadline });
        }
        Ok(items)
    }
}

impl MessageQueue for MemoryQueue {
    fn enqueue<'a>(&'a self, body: &'a str) -> QueueFuture<'a, String> {
        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            self.state().pending.push_back(Entry {
                id: id.clone(),
                body: body.to_string(),
            });
            self.notify.notify_one();
            debug!(id = %id, size = body.len(), "Enqueued item in memory");
            Ok(id)
        })
    }

    fn approximate_backlog(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let mut state = self.state();
            state.requeue_expired(Instant::now());
            Ok(state.pending.len())
        })
    }

    fn receive(&self, options: ReceiveOptions) -> QueueFuture<'_, Vec<ReceivedItem>> {
        Box::pin(async move {
            if options.max_items == 0 {
                return Ok(Vec::new());
            }
            let wait_until = Instant::now() + options.wait;
            loop {
                let next_expiry = match self.take(&options) {
                    Ok(items) => return Ok(items),
                    Err(next_expiry) => next_expiry,
                };
                if Instant::now() >= wait_until {
                    return Ok(Vec::new());
                }
                let wake = next_expiry.map_or(wait_until, |expiry| expiry.min(wait_until));
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep_until(wake) => {}
                }
            }
        })
    }

    fn delete<'a>(&'a self, receipt: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.state();
            match state.in_flight.remove(receipt) {
                Some(item) if item.deadline > now => {
                    debug!(id = %item.entry.id, "Deleted item from memory queue");
                    Ok(())
                }
                Some(item) => {
                    warn!(id = %item.entry.id, "Delete attempted after visibility timeout");
                    state.pending.push_back(item.entry);
                    Err(QueueError::StaleReceipt(receipt.to_string()))
                }
                None => Err(QueueError::StaleReceipt(receipt.to_string())),
            }
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn options(max_items: usize, wait_secs: u64) -> ReceiveOptions {
        ReceiveOptions {
            max_items,
            visibility_timeout: Duration::from_secs(10),
            wait: Duration::from_secs(wait_secs),
        }
    }

    #[tokio::test]
    async fn test_enqueue_receive_delete() {
        let queue = MemoryQueue::new();
        queue.enqueue("one").await.unwrap();
        queue.enqueue("two").await.unwrap();
        assert_eq!(queue.approximate_backlog().await.unwrap(), 2);

        let items = queue.receive(options(5, 0)).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].body, "one");
        assert_eq!(items[1].body, "two");
        assert_eq!(queue.approximate_backlog().await.unwrap(), 0);
        assert_eq!(queue.in_flight(), 2);

        for item in &items {
            queue.delete(&item.receipt).await.unwrap();
        }
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size() {
        let queue = MemoryQueue::new();
        for i in 0..7 {
            queue.enqueue(&format!("item-{i}")).await.unwrap();
        }
        assert_eq!(queue.receive(options(5, 0)).await.unwrap().len(), 5);
        assert_eq!(queue.receive(options(5, 0)).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let queue = MemoryQueue::new();
        queue.enqueue("payload").await.unwrap();

        let first = queue.receive(options(5, 0)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(options(5, 0)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;

        let second = queue.receive(options(5, 0)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "payload");
        assert_ne!(second[0].receipt, first[0].receipt);

        assert!(matches!(
            queue.delete(&first[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        queue.delete(&second[0].receipt).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_after_expiry_is_stale() {
        let queue = MemoryQueue::new();
        queue.enqueue("payload").await.unwrap();
        let items = queue.receive(options(1, 0)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            queue.delete(&items[0].receipt).await,
            Err(QueueError::StaleReceipt(_))
        ));
        assert_eq!(queue.approximate_backlog().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_returns_empty_after_wait() {
        let queue = MemoryQueue::new();
        let started = Instant::now();
        let items = queue.receive(options(5, 5)).await.unwrap();
        assert!(items.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(options(5, 5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.enqueue("late").await.unwrap();

        let items = receiver.await.unwrap().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].body, "late");
    }

    #[tokio::test]
    async fn test_unknown_receipt_is_stale() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.delete("nope").await,
            Err(QueueError::StaleReceipt(_))
        ));
    }
}
