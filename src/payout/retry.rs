//! Bounded exponential backoff for transfer attempts
//!
//! The ledger decides *whether* a failed payout gets another attempt using
//! `RetryPolicy`; the `RetryCoordinator` decides *when* by holding one deferred
//! task per payout. The two are connected by the `RetryQueue` channel, so
//! reporting a failure never waits on the retry itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::dispatcher::{AttemptResult, TransferDispatcher};
use crate::escrow::EscrowLedger;
use crate::gateway::FailureKind;

/// Backoff configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow failed attempt number `attempt`
    pub fn should_retry(&self, attempt: u32, kind: FailureKind) -> bool {
        kind == FailureKind::Retryable && attempt < self.max_attempts
    }

    /// delay(n) = min(base * multiplier^(n-1), cap)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Request for a transfer attempt after `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRequest {
    pub payout_id: Uuid,
    pub attempt: i32,
    pub delay: Duration,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("retry coordinator is not running")]
pub struct RetryQueueClosed;

/// Sending half of the retry channel
#[derive(Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<RetryRequest>,
}

impl RetryQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RetryRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, request: RetryRequest) -> Result<(), RetryQueueClosed> {
        self.tx.send(request).map_err(|_| RetryQueueClosed)
    }

    /// First attempt for a freshly requested payout
    pub fn dispatch_now(&self, payout_id: Uuid) -> Result<(), RetryQueueClosed> {
        self.schedule(RetryRequest {
            payout_id,
            attempt: 1,
            delay: Duration::ZERO,
        })
    }
}

/// Owns the deferred transfer attempts, keyed by payout id
pub struct RetryCoordinator {
    dispatcher: Arc<TransferDispatcher>,
    ledger: Arc<EscrowLedger>,
    policy: RetryPolicy,
    scheduled: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl RetryCoordinator {
    pub fn new(
        dispatcher: Arc<TransferDispatcher>,
        ledger: Arc<EscrowLedger>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            dispatcher,
            ledger,
            policy,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume retry requests until every `RetryQueue` handle is dropped
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RetryRequest>) {
        tracing::info!("Retry coordinator started");

        while let Some(request) = rx.recv().await {
            self.schedule(request).await;
        }

        tracing::info!("Retry coordinator stopped");
    }

    /// Arm the timer for a payout, replacing any earlier timer for it
    pub async fn schedule(self: &Arc<Self>, request: RetryRequest) {
        let mut scheduled = self.scheduled.lock().await;
        scheduled.retain(|_, handle| !handle.is_finished());

        if let Some(previous) = scheduled.remove(&request.payout_id) {
            previous.abort();
        }

        tracing::debug!(
            payout_id = %request.payout_id,
            attempt = request.attempt,
            delay_ms = request.delay.as_millis() as u64,
            "Transfer attempt scheduled"
        );

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !request.delay.is_zero() {
                tokio::time::sleep(request.delay).await;
            }
            // aborting the timer must never interrupt a transfer in flight
            tokio::spawn(async move { coordinator.run_attempt(request).await });
        });

        scheduled.insert(request.payout_id, handle);
    }

    async fn run_attempt(&self, request: RetryRequest) {
        match self.dispatcher.attempt(request.payout_id).await {
            Ok(AttemptResult::Initiated(payout)) => {
                tracing::info!(
                    payout_id = %payout.id,
                    reference = ?payout.transfer_reference,
                    "Transfer initiated, awaiting processor outcome"
                );
            }
            Ok(AttemptResult::Settled(settlement)) => {
                tracing::info!(
                    payout_id = %request.payout_id,
                    settlement = ?settlement,
                    "Transfer attempt settled synchronously"
                );
            }
            Ok(AttemptResult::Skipped) => {
                tracing::debug!(payout_id = %request.payout_id, "Transfer attempt skipped");
            }
            Err(err) if err.is_infrastructure() => {
                // an unclaimed payout is still PENDING; a claimed one is skipped
                tracing::error!(
                    payout_id = %request.payout_id,
                    error = %err,
                    "Transfer attempt aborted, retrying after {:?}",
                    self.policy.max_delay
                );
                let retry = RetryRequest {
                    delay: self.policy.max_delay,
                    ..request
                };
                if let Err(err) = self.ledger.retry_queue().schedule(retry) {
                    tracing::error!(payout_id = %request.payout_id, error = %err, "Could not reschedule transfer attempt");
                }
            }
            Err(err) => {
                tracing::error!(
                    payout_id = %request.payout_id,
                    error = %err,
                    "Transfer attempt failed"
                );
            }
        }
    }

    /// Drop the pending timer for a payout, if any
    pub async fn cancel(&self, payout_id: Uuid) -> bool {
        match self.scheduled.lock().await.remove(&payout_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of timers that have not fired yet
    pub async fn pending(&self) -> usize {
        let scheduled = self.scheduled.lock().await;
        scheduled.values().filter(|h| !h.is_finished()).count()
    }

    /// Re-arm timers for every PENDING payout found in storage. Called once on
    /// start-up so that scheduled retries survive a restart. Claimed attempts
    /// are never resent; those without a recorded transfer are flagged for
    /// review instead.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, crate::escrow::EscrowError> {
        let flagged = self.ledger.flag_unconfirmed_dispatches().await?;
        if flagged > 0 {
            tracing::warn!(flagged, "Interrupted transfer attempts await manual review");
        }

        let payouts = self.ledger.pending_payouts().await?;
        let count = payouts.len();

        for payout in payouts {
            let delay = if payout.attempts == 0 {
                Duration::ZERO
            } else {
                self.policy.delay_for(payout.attempts as u32)
            };

            self.schedule(RetryRequest {
                payout_id: payout.id,
                attempt: payout.attempts + 1,
                delay,
            })
            .await;
        }

        if count > 0 {
            tracing::info!(count, "Recovered pending payouts");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_is_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, FailureKind::Retryable));
        assert!(policy.should_retry(2, FailureKind::Retryable));
        assert!(!policy.should_retry(3, FailureKind::Retryable));
        assert!(!policy.should_retry(4, FailureKind::Retryable));
    }

    #[test]
    fn test_terminal_failures_never_retry() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            assert!(!policy.should_retry(attempt, FailureKind::Terminal));
        }
    }

    #[test]
    fn test_delay_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_queue_reports_closed_coordinator() {
        let (queue, rx) = RetryQueue::channel();
        let payout_id = Uuid::new_v4();
        assert!(queue.dispatch_now(payout_id).is_ok());

        drop(rx);
        assert_eq!(queue.dispatch_now(payout_id), Err(RetryQueueClosed));
    }
}
