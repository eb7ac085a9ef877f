//! Built-in steps of the forwarding pipeline.
//!
//! Each step covers one stage of forwarding an inbound message: validating
//! the notification, resolving the recipients, fetching the stored message,
//! rewriting its headers and handing the result to the queue.

pub mod enqueue;
pub mod fetch;
pub mod resolve;
pub mod rewrite;
pub mod validate;

pub use enqueue::*;
pub use fetch::*;
pub use resolve::*;
pub use rewrite::*;
pub use validate::*;
