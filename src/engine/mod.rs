//! Engine hooks: the narrow interface between the queue feed and a task engine.
//!
//! The engine reports two lifecycle signals (idle, task completed) and accepts
//! two effects (submit a task, veto termination for the current idle cycle).
//! [`LocalEngine`] is an in-process engine speaking this interface;
//! [`QueueFeed`] is the listener that keeps it supplied from a queue.

pub mod feed;
pub mod handler;
pub mod local;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::model::{Completion, Task};

pub use feed::{AckPolicy, FeedConfig, QueueFeed, Trigger};
pub use handler::{CommandHandler, TaskHandler};
pub use local::{EngineConfig, EngineExit, LocalEngine};

/// Effects the feed can apply to an engine.
pub trait Engine: Send + Sync {
    /// Enqueue a task into the engine's scheduler.
    fn submit(&self, task: Task) -> Result<()>;

    /// Veto engine shutdown for the idle cycle currently being handled.
    fn request_no_terminate(&self);
}

/// Lifecycle signals fired by an engine.
#[derive(Debug)]
pub enum EngineSignal {
    /// No task is pending or running. The engine waits for `done` before it
    /// decides whether to close.
    Idle { done: oneshot::Sender<()> },
    /// One task finished, whatever its outcome.
    TaskCompleted(Completion),
}

impl EngineSignal {
    /// Build an idle signal and the receiver the engine waits on.
    pub fn idle() -> (Self, oneshot::Receiver<()>) {
        let (done, waiting) = oneshot::channel();
        (Self::Idle { done }, waiting)
    }
}
