//! Escrow ledger: the authoritative state machine for payments and payouts
//!
//! Payment: PENDING -> ESCROW -> RELEASED | REFUNDED, PENDING -> FAILED.
//! Payout:  PENDING -> PROCESSING -> COMPLETED | FAILED, PROCESSING -> PENDING
//! while retries remain.
//!
//! Every write goes through one atomic `LedgerStore` call. Anything that moves a
//! payout takes that payout's `PayoutGuard` first; events are published only
//! after the write has committed. An attempt is claimed in the store (PENDING ->
//! PROCESSING with its reference) before the processor is called, so no other
//! process can start a second transfer for the same payout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;
use validator::Validate;

use super::error::{EscrowError, EscrowResult, StoreError};
use super::locks::{KeyGuard, KeyedLocks, PayoutGuard};
use super::model::{
    split_amount, CreatePaymentRequest, EscrowEvent, EventClaim, EventSink, NewWebhookEvent,
    Payment, PaymentStatus, PaymentWithPayouts, Payout, PayoutStatus, Recipient,
    RegisterRecipientRequest, TransferAssignment,
};
use super::store::LedgerStore;
use crate::gateway::FailureKind;
use crate::payout::{RetryPolicy, RetryQueue, RetryRequest};

/// Verdict on a transfer the processor has finished with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    Failure { kind: FailureKind, reason: String },
}

/// Where a payout ended up after an outcome or failed attempt was applied
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutSettlement {
    Completed {
        payout: Payout,
        payment: Payment,
    },
    RetryScheduled {
        payout: Payout,
        next_attempt: i32,
        delay: Duration,
    },
    Failed {
        payout: Payout,
        payment: Payment,
    },
}

impl PayoutSettlement {
    pub fn payout(&self) -> &Payout {
        match self {
            PayoutSettlement::Completed { payout, .. }
            | PayoutSettlement::RetryScheduled { payout, .. }
            | PayoutSettlement::Failed { payout, .. } => payout,
        }
    }
}

/// Tunables for the ledger
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub policy: RetryPolicy,
    pub fee_percent: Decimal,
    pub default_currency: String,
    /// How long a webhook handler may hold an event before a redelivery may
    /// take it over
    pub webhook_claim_lease: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            fee_percent: Decimal::TEN,
            default_currency: "NGN".to_string(),
            webhook_claim_lease: Duration::from_secs(300),
        }
    }
}

pub struct EscrowLedger {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn EventSink>,
    retry_queue: RetryQueue,
    payout_locks: KeyedLocks,
    recipient_locks: KeyedLocks,
    settings: LedgerSettings,
}

impl EscrowLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn EventSink>,
        retry_queue: RetryQueue,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            sink,
            retry_queue,
            payout_locks: KeyedLocks::new(),
            recipient_locks: KeyedLocks::new(),
            settings,
        }
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.settings.policy
    }

    // ===== Payments =====

    /// Create a PENDING payment for a booking, splitting off the platform fee
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> EscrowResult<Payment> {
        request.validate()?;

        let currency = request
            .currency
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| self.settings.default_currency.clone());
        let (escrow_amount, platform_fee) =
            split_amount(request.amount, self.settings.fee_percent);

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            booking_id: request.booking_id,
            provider_id: request.provider_id,
            amount: request.amount,
            currency,
            status: PaymentStatus::Pending,
            processor_reference: format!("pay_{}", Uuid::new_v4().simple()),
            escrow_amount,
            platform_fee,
            needs_review: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        };
        if !payment.split_is_consistent() {
            return Err(EscrowError::Validation(format!(
                "fee split {} + {} does not add up to {}",
                payment.escrow_amount, payment.platform_fee, payment.amount
            )));
        }

        let payment = self.store.insert_payment(&payment).await?;

        tracing::info!(
            payment_id = %payment.id,
            booking_id = %payment.booking_id,
            amount = %payment.amount,
            fee = %payment.platform_fee,
            "Payment created"
        );
        self.sink.publish(EscrowEvent::PaymentCreated {
            payment_id: payment.id,
            booking_id: payment.booking_id,
        });

        Ok(payment)
    }

    /// PENDING -> ESCROW once the processor has confirmed the charge
    pub async fn confirm_charge(&self, payment_id: Uuid) -> EscrowResult<Payment> {
        let payment = self
            .store
            .transition_payment(payment_id, PaymentStatus::Pending, PaymentStatus::Escrow)
            .await?;

        tracing::info!(payment_id = %payment.id, "Charge confirmed, funds in escrow");
        self.sink.publish(EscrowEvent::PaymentEscrowed {
            payment_id: payment.id,
        });

        Ok(payment)
    }

    pub async fn confirm_charge_by_reference(&self, reference: &str) -> EscrowResult<Payment> {
        let payment = self
            .store
            .find_payment_by_reference(reference)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("payment with reference {}", reference)))?;

        self.confirm_charge(payment.id).await
    }

    /// PENDING -> FAILED
    pub async fn fail_charge(&self, payment_id: Uuid, reason: &str) -> EscrowResult<Payment> {
        let payment = self
            .store
            .transition_payment(payment_id, PaymentStatus::Pending, PaymentStatus::Failed)
            .await?;

        tracing::warn!(payment_id = %payment.id, reason, "Charge failed");
        self.sink.publish(EscrowEvent::PaymentFailed {
            payment_id: payment.id,
            reason: reason.to_string(),
        });

        Ok(payment)
    }

    /// ESCROW -> REFUNDED, only while no payout is in flight
    pub async fn refund(&self, payment_id: Uuid) -> EscrowResult<Payment> {
        let payment = self.store.refund_payment(payment_id).await?;

        tracing::info!(payment_id = %payment.id, "Payment refunded");
        self.sink.publish(EscrowEvent::PaymentRefunded {
            payment_id: payment.id,
        });

        Ok(payment)
    }

    // ===== Payouts =====

    /// Create a PENDING payout for an escrowed payment and queue its first
    /// attempt. Fails with `InvalidState` unless the payment is in ESCROW
    /// without an active or completed payout.
    pub async fn request_release(&self, payment_id: Uuid) -> EscrowResult<Payout> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Escrow {
            return Err(EscrowError::InvalidState(format!(
                "payment {} is {}, expected {}",
                payment.id,
                payment.status,
                PaymentStatus::Escrow
            )));
        }
        if payment.escrow_amount <= Decimal::ZERO {
            return Err(EscrowError::InvalidState(format!(
                "payment {} has nothing left to release after the platform fee",
                payment.id
            )));
        }

        // the store re-checks both conditions atomically
        let payout = self.store.insert_payout(&Payout::for_payment(&payment)).await?;

        tracing::info!(
            payout_id = %payout.id,
            payment_id = %payment.id,
            amount = %payout.amount,
            "Escrow release requested"
        );
        self.sink.publish(EscrowEvent::PayoutRequested {
            payment_id: payment.id,
            payout_id: payout.id,
        });

        if let Err(err) = self.retry_queue.dispatch_now(payout.id) {
            // still PENDING, so the start-up recovery sweep will pick it up
            tracing::error!(payout_id = %payout.id, error = %err, "Could not queue first transfer attempt");
        }

        Ok(payout)
    }

    /// Serialize work on one payout within this process
    pub async fn lock_payout(&self, payout_id: Uuid) -> PayoutGuard {
        PayoutGuard::new(self.payout_locks.acquire(payout_id).await)
    }

    /// Serialize recipient creation for one provider
    pub async fn lock_recipient(&self, provider_id: Uuid) -> KeyGuard {
        self.recipient_locks.acquire(provider_id).await
    }

    /// The payout and its payment if the payout is waiting for an attempt
    pub async fn payout_for_attempt(
        &self,
        guard: &PayoutGuard,
    ) -> EscrowResult<Option<(Payout, Payment)>> {
        let payout = self.get_payout(guard.payout_id()).await?;
        if payout.status != PayoutStatus::Pending || payout.retries_halted {
            return Ok(None);
        }

        let payment = self.get_payment(payout.payment_id).await?;
        Ok(Some((payout, payment)))
    }

    /// PENDING -> PROCESSING under `reference`, before anything is sent. `None`
    /// when another dispatcher got there first or the payout moved on.
    pub async fn claim_attempt(
        &self,
        guard: &PayoutGuard,
        reference: &str,
    ) -> EscrowResult<Option<Payout>> {
        let payout = match self
            .store
            .claim_payout_attempt(guard.payout_id(), reference)
            .await
        {
            Ok(payout) => payout,
            Err(StoreError::Conflict(reason)) => {
                tracing::debug!(payout_id = %guard.payout_id(), reason = %reason, "Attempt not claimed");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            payout_id = %payout.id,
            reference,
            attempt = payout.attempts + 1,
            "Payout processing"
        );
        self.sink.publish(EscrowEvent::PayoutProcessing {
            payment_id: payout.payment_id,
            payout_id: payout.id,
            reference: reference.to_string(),
            attempt: payout.attempts + 1,
        });

        Ok(Some(payout))
    }

    /// Attach the processor's transfer to the claimed attempt
    pub async fn record_transfer(
        &self,
        guard: &PayoutGuard,
        assignment: &TransferAssignment,
    ) -> EscrowResult<Payout> {
        let payout = self
            .store
            .record_transfer(guard.payout_id(), assignment)
            .await?;

        tracing::info!(
            payout_id = %payout.id,
            reference = %assignment.reference,
            transfer_code = %assignment.transfer_code,
            "Transfer accepted by processor"
        );

        Ok(payout)
    }

    /// Settle a claimed attempt that failed before the processor accepted it
    pub async fn record_attempt_failure(
        &self,
        guard: &PayoutGuard,
        kind: FailureKind,
        reason: &str,
    ) -> EscrowResult<PayoutSettlement> {
        let payout = self.get_payout(guard.payout_id()).await?;
        if payout.status != PayoutStatus::Processing {
            return Err(EscrowError::InvalidState(format!(
                "payout {} is {}, expected {}",
                payout.id,
                payout.status,
                PayoutStatus::Processing
            )));
        }

        self.settle_failure(&payout, kind, reason).await
    }

    /// Apply the processor's verdict on a PROCESSING payout
    pub async fn apply_transfer_outcome(
        &self,
        payout_id: Uuid,
        outcome: TransferOutcome,
    ) -> EscrowResult<PayoutSettlement> {
        let _guard = self.lock_payout(payout_id).await;

        let payout = self.get_payout(payout_id).await?;
        if payout.status != PayoutStatus::Processing {
            return Err(EscrowError::InvalidState(format!(
                "payout {} is {}, expected {}",
                payout.id,
                payout.status,
                PayoutStatus::Processing
            )));
        }

        match outcome {
            TransferOutcome::Success => {
                let (payout, payment) = self.store.complete_payout(payout_id).await?;

                tracing::info!(
                    payout_id = %payout.id,
                    payment_id = %payment.id,
                    "Payout completed, payment released"
                );
                self.sink.publish(EscrowEvent::PayoutCompleted {
                    payment_id: payment.id,
                    payout_id: payout.id,
                });
                self.sink.publish(EscrowEvent::PaymentReleased {
                    payment_id: payment.id,
                    payout_id: payout.id,
                });

                Ok(PayoutSettlement::Completed { payout, payment })
            }
            TransferOutcome::Failure { kind, reason } => {
                self.settle_failure(&payout, kind, &reason).await
            }
        }
    }

    /// Count the failed attempt, then requeue or give up. The caller holds the
    /// payout's guard.
    async fn settle_failure(
        &self,
        payout: &Payout,
        kind: FailureKind,
        reason: &str,
    ) -> EscrowResult<PayoutSettlement> {
        let attempts = payout.attempts + 1;
        let mut from = payout.status;

        if !payout.retries_halted && self.settings.policy.should_retry(attempts as u32, kind) {
            let requeued = self
                .store
                .requeue_payout(payout.id, from, attempts, reason)
                .await?;
            let delay = self.settings.policy.delay_for(attempts as u32);
            let request = RetryRequest {
                payout_id: payout.id,
                attempt: attempts + 1,
                delay,
            };

            match self.retry_queue.schedule(request) {
                Ok(()) => {
                    tracing::warn!(
                        payout_id = %payout.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "Transfer failed, retry scheduled"
                    );
                    self.sink.publish(EscrowEvent::PayoutRetryScheduled {
                        payment_id: requeued.payment_id,
                        payout_id: requeued.id,
                        attempt: attempts + 1,
                        delay_ms: delay.as_millis() as u64,
                    });

                    return Ok(PayoutSettlement::RetryScheduled {
                        payout: requeued,
                        next_attempt: attempts + 1,
                        delay,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        payout_id = %payout.id,
                        error = %err,
                        "Retry could not be scheduled, treating retries as exhausted"
                    );
                    from = PayoutStatus::Pending;
                }
            }
        }

        let (payout, payment) = self
            .store
            .fail_payout(payout.id, from, attempts, reason)
            .await?;
        self.announce_failure(&payout, &payment, reason);

        Ok(PayoutSettlement::Failed { payout, payment })
    }

    fn announce_failure(&self, payout: &Payout, payment: &Payment, reason: &str) {
        tracing::error!(
            payout_id = %payout.id,
            payment_id = %payment.id,
            attempts = payout.attempts,
            reason,
            "Payout failed, payment held in escrow for manual review"
        );
        self.sink.publish(EscrowEvent::PayoutFailed {
            payment_id: payment.id,
            payout_id: payout.id,
            attempts: payout.attempts,
            reason: reason.to_string(),
        });
        self.sink.publish(EscrowEvent::ManualReviewRequired {
            payment_id: payment.id,
            payout_id: payout.id,
            reason: reason.to_string(),
        });
    }

    /// Manual "no further retries" override. A PENDING payout fails at once; a
    /// PROCESSING payout keeps its in-flight transfer and any failure reported
    /// for it becomes final.
    pub async fn halt_retries(&self, payout_id: Uuid) -> EscrowResult<Payout> {
        let _guard = self.lock_payout(payout_id).await;

        let payout = self.store.halt_payout_retries(payout_id).await?;
        tracing::warn!(payout_id = %payout.id, status = %payout.status, "Payout retries halted");

        if payout.status != PayoutStatus::Pending {
            return Ok(payout);
        }

        let reason = "retries halted by operator";
        let (payout, payment) = self
            .store
            .fail_payout(payout.id, PayoutStatus::Pending, payout.attempts, reason)
            .await?;
        self.announce_failure(&payout, &payment, reason);

        Ok(payout)
    }

    // ===== Recipients =====

    pub async fn recipient_for(&self, provider_id: Uuid) -> EscrowResult<Option<Recipient>> {
        Ok(self.store.get_recipient(provider_id).await?)
    }

    /// Insert or replace a provider's payout destination
    pub async fn register_recipient(
        &self,
        provider_id: Uuid,
        request: RegisterRecipientRequest,
    ) -> EscrowResult<Recipient> {
        request.validate()?;

        let now = Utc::now();
        let recipient = Recipient {
            provider_id,
            bank_code: request.bank_code.trim().to_string(),
            account_number: request.account_number,
            account_name: request.account_name.trim().to_string(),
            recipient_code: None,
            created_at: now,
            updated_at: now,
        };

        let recipient = self.store.upsert_recipient(&recipient).await?;
        tracing::info!(
            provider_id = %provider_id,
            bank_code = %recipient.bank_code,
            has_code = recipient.recipient_code.is_some(),
            "Payout destination registered"
        );

        Ok(recipient)
    }

    /// Remember the processor recipient code created for `snapshot`
    pub async fn cache_recipient_code(
        &self,
        snapshot: &Recipient,
        code: &str,
    ) -> EscrowResult<Recipient> {
        Ok(self.store.set_recipient_code(snapshot, code).await?)
    }

    // ===== Reads =====

    pub async fn get_payment(&self, payment_id: Uuid) -> EscrowResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("payment {}", payment_id)))
    }

    pub async fn get_payout(&self, payout_id: Uuid) -> EscrowResult<Payout> {
        self.store
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("payout {}", payout_id)))
    }

    pub async fn payment_with_payouts(&self, payment_id: Uuid) -> EscrowResult<PaymentWithPayouts> {
        let payment = self.get_payment(payment_id).await?;
        let payouts = self.store.list_payouts_for_payment(payment_id).await?;
        Ok(PaymentWithPayouts { payment, payouts })
    }

    pub async fn find_payout_by_reference(&self, reference: &str) -> EscrowResult<Option<Payout>> {
        Ok(self.store.find_payout_by_reference(reference).await?)
    }

    pub async fn pending_payouts(&self) -> EscrowResult<Vec<Payout>> {
        Ok(self.store.list_pending_payouts().await?)
    }

    /// Flag every payment whose payout was claimed but never recorded a
    /// transfer. The payout stays PROCESSING so a late webhook can still settle
    /// it; nothing is resent.
    pub async fn flag_unconfirmed_dispatches(&self) -> EscrowResult<usize> {
        let payouts = self.store.list_unconfirmed_dispatches().await?;
        let mut flagged = 0;

        for payout in payouts {
            let reason = format!(
                "transfer attempt {} was interrupted, outcome unknown",
                payout.transfer_reference.as_deref().unwrap_or("-")
            );
            match self
                .store
                .flag_payment_for_review(payout.payment_id, &reason)
                .await
            {
                Ok(payment) => {
                    tracing::error!(
                        payout_id = %payout.id,
                        payment_id = %payment.id,
                        reference = ?payout.transfer_reference,
                        "Unconfirmed transfer attempt flagged for manual review"
                    );
                    self.sink.publish(EscrowEvent::ManualReviewRequired {
                        payment_id: payment.id,
                        payout_id: payout.id,
                        reason,
                    });
                    flagged += 1;
                }
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(flagged)
    }

    // ===== Webhook idempotency =====

    pub async fn claim_webhook_event(&self, event: &NewWebhookEvent) -> EscrowResult<EventClaim> {
        Ok(self
            .store
            .claim_webhook_event(event, self.settings.webhook_claim_lease)
            .await?)
    }

    pub async fn finish_webhook_event(
        &self,
        external_id: &str,
        error: Option<&str>,
    ) -> EscrowResult<()> {
        Ok(self.store.complete_webhook_event(external_id, error).await?)
    }

    pub async fn ping(&self) -> EscrowResult<()> {
        Ok(self.store.ping().await?)
    }
}
