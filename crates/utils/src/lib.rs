pub mod alias;
pub mod config;
pub mod delivery;
pub mod directories;
pub mod drainer;
pub mod event;
pub mod logging;
pub mod message;
pub mod mime;
pub mod pipeline;
pub mod queue;
pub mod queues;
pub mod rewriter;
pub mod steps;
pub mod storage;

pub use alias::*;
pub use config::*;
pub use delivery::*;
pub use directories::*;
pub use drainer::*;
pub use event::*;
pub use message::*;
pub use mime::*;
pub use pipeline::*;
pub use queue::*;
pub use queues::*;
pub use rewriter::*;
pub use steps::*;
pub use storage::*;
