//! Concrete [`MessageQueue`](crate::MessageQueue) implementations.
//!
//! Contains [`MemoryQueue`] for in-process use and [`RedisQueue`]
//! (feature-gated behind `redis`) for a shared queue between the
//! receiving and draining processes.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use memory::*;
#[cfg(feature = "redis")]
pub use redis_queue::*;
