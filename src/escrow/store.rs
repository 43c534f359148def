//! Persistence seam for the escrow ledger
//!
//! Every method is one atomic unit: it either applies all of its writes or none
//! of them, and it re-checks its own preconditions under the store's lock (row
//! locks in Postgres, the state mutex in memory). A failed precondition is
//! reported as `StoreError::Conflict` and writes nothing.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::StoreResult;
use super::model::{
    EventClaim, NewWebhookEvent, Payment, PaymentStatus, Payout, PayoutStatus, Recipient,
    TransferAssignment,
};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new payment. Conflict if the booking already has one.
    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment>;

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn find_payment_by_reference(
        &self,
        processor_reference: &str,
    ) -> StoreResult<Option<Payment>>;

    /// Compare-and-set on payment status
    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> StoreResult<Payment>;

    /// ESCROW -> REFUNDED, only while no payout is active
    async fn refund_payment(&self, id: Uuid) -> StoreResult<Payment>;

    /// Insert a PENDING payout. The payment must be in ESCROW with no active
    /// or completed payout; its review flag is cleared.
    async fn insert_payout(&self, payout: &Payout) -> StoreResult<Payout>;

    async fn get_payout(&self, id: Uuid) -> StoreResult<Option<Payout>>;

    async fn find_payout_by_reference(&self, reference: &str) -> StoreResult<Option<Payout>>;

    async fn list_payouts_for_payment(&self, payment_id: Uuid) -> StoreResult<Vec<Payout>>;

    /// PENDING payouts whose retries have not been halted, oldest first
    async fn list_pending_payouts(&self) -> StoreResult<Vec<Payout>>;

    /// Claim an attempt before anything is sent: PENDING -> PROCESSING with the
    /// attempt's reference stored and no transfer code yet. Conflict if the
    /// payout is not PENDING, has retries halted or the reference was used.
    async fn claim_payout_attempt(&self, id: Uuid, reference: &str) -> StoreResult<Payout>;

    /// Record the processor's transfer for the claimed attempt. Conflict
    /// unless the payout is PROCESSING under `assignment.reference`.
    async fn record_transfer(
        &self,
        id: Uuid,
        assignment: &TransferAssignment,
    ) -> StoreResult<Payout>;

    /// PROCESSING payouts whose claimed attempt never recorded a transfer
    async fn list_unconfirmed_dispatches(&self) -> StoreResult<Vec<Payout>>;

    /// Flag an ESCROW payment for manual review without touching its payouts
    async fn flag_payment_for_review(&self, id: Uuid, reason: &str) -> StoreResult<Payment>;

    /// `from` -> PENDING with the new attempt count, awaiting another attempt
    async fn requeue_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<Payout>;

    /// PROCESSING -> COMPLETED together with payment ESCROW -> RELEASED
    async fn complete_payout(&self, id: Uuid) -> StoreResult<(Payout, Payment)>;

    /// `from` -> FAILED; the payment stays in ESCROW and is flagged for review
    async fn fail_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<(Payout, Payment)>;

    /// Set the "no further retries" override on an active payout
    async fn halt_payout_retries(&self, id: Uuid) -> StoreResult<Payout>;

    async fn get_recipient(&self, provider_id: Uuid) -> StoreResult<Option<Recipient>>;

    /// Insert or replace a provider's destination. The cached recipient code
    /// survives only when bank, account number and name are unchanged.
    async fn upsert_recipient(&self, recipient: &Recipient) -> StoreResult<Recipient>;

    /// Cache a processor recipient code for the destination in `snapshot`.
    /// An already cached code wins. Conflict if the destination has changed.
    async fn set_recipient_code(&self, snapshot: &Recipient, code: &str)
        -> StoreResult<Recipient>;

    /// Transactional check-and-set on the webhook idempotency ledger. A
    /// `received` row untouched for longer than `lease` is claimed again.
    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        lease: Duration,
    ) -> StoreResult<EventClaim>;

    /// Mark a claimed event processed, or record the error detail
    async fn complete_webhook_event(&self, external_id: &str, error: Option<&str>)
        -> StoreResult<()>;

    /// Connectivity check for health reporting
    async fn ping(&self) -> StoreResult<()>;
}
