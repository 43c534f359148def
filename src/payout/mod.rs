//! Payout execution: transfer attempts and their retry scheduling

mod dispatcher;
mod retry;

pub use dispatcher::{transfer_reference, AttemptResult, TransferDispatcher};
pub use retry::{RetryCoordinator, RetryPolicy, RetryQueue, RetryQueueClosed, RetryRequest};
