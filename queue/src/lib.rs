//! # CocoaTrack Operation Queue
//!
//! Durable, idempotent queue of local mutations: priority-then-FIFO
//! draining order, a closed status state machine, exponential-backoff
//! retry policy with battery gating, and cross-user isolation.

pub mod error;
pub mod queue;
pub mod retry;
pub mod user_switch;

#[cfg(test)]
mod proptests;

pub use error::{QueueError, QueueResult};
pub use queue::{BATTERY_PAUSE_MESSAGE, ConflictResolution, NewOperation, OperationQueue};
pub use retry::{NON_RETRYABLE_CODES, RetryDecision, RetryPolicy};
pub use user_switch::UserSwitchOutcome;
