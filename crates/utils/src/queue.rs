//! Message queue abstraction shared by the pipeline and the drainer.
//!
//! The queue follows receipt-handle semantics: a received item stays hidden
//! from other consumers for the visibility timeout and is only removed when
//! deleted with the receipt handed out at receive time. Items that are not
//! deleted in time become visible again and are redelivered.

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Boxed future type for queue operations, enabling object safety.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = QueueResult<T>> + Send + 'a>>;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue service could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A queue item could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The queue service rejected the operation.
    #[error("Queue operation error: {0}")]
    Operation(String),

    /// The receipt handle expired or was never handed out.
    #[error("Stale receipt handle: {0}")]
    StaleReceipt(String),
}

/// Parameters of a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of items returned.
    pub max_items: usize,

    /// How long received items stay hidden from other consumers.
    pub visibility_timeout: Duration,

    /// How long to wait for an item when the queue is empty.
    pub wait: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_items: 5,
            visibility_timeout: Duration::from_secs(10),
            wait: Duration::from_secs(5),
        }
    }
}

/// An item handed out by [`MessageQueue::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedItem {
    /// Item payload as it was enqueued.
    pub body: String,

    /// Handle required to delete the item, valid for the visibility window.
    pub receipt: String,
}

/// Trait for queues carrying transformed messages to the drainer.
pub trait MessageQueue: Send + Sync {
    /// Appends an item to the queue, returning its queue id.
    fn enqueue<'a>(&'a self, body: &'a str) -> QueueFuture<'a, String>;

    /// Returns the approximate number of items waiting to be received.
    fn approximate_backlog(&self) -> QueueFuture<'_, usize>;

    /// Receives up to `max_items` items, hiding them for the visibility timeout.
    fn receive(&self, options: ReceiveOptions) -> QueueFuture<'_, Vec<ReceivedItem>>;

    /// Deletes a received item using its receipt handle.
    fn delete<'a>(&'a self, receipt: &'a str) -> QueueFuture<'a, ()>;

    /// Returns the name of this queue.
    fn name(&self) -> &str;
}
