//! The bridged child process and its queues.

pub mod bridge;
mod output;
pub mod queue;

pub use bridge::{BridgeConfig, BridgeError, BridgeState, ProcessBridge};
pub use output::OutputSubscription;
pub use queue::{InputQueue, OverflowPolicy, Pushed, QueueError};
