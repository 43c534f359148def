//! In-memory ledger store
//!
//! All records live behind a single async mutex, so every operation observes and
//! mutates a consistent snapshot.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::model::{
    EventClaim, NewWebhookEvent, Payment, PaymentStatus, Payout, PayoutStatus, Recipient,
    TransferAssignment, WebhookEventRecord, WebhookEventStatus,
};
use super::store::LedgerStore;

#[derive(Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    payouts: HashMap<Uuid, Payout>,
    recipients: HashMap<Uuid, Recipient>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

impl MemoryState {
    fn payment_mut(&mut self, id: Uuid) -> StoreResult<&mut Payment> {
        self.payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))
    }

    fn payout_mut(&mut self, id: Uuid) -> StoreResult<&mut Payout> {
        self.payouts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))
    }

    fn has_payout_in(&self, payment_id: Uuid, statuses: &[PayoutStatus]) -> bool {
        self.payouts
            .values()
            .any(|p| p.payment_id == payment_id && statuses.contains(&p.status))
    }
}

fn payment_conflict(payment: &Payment, expected: PaymentStatus) -> StoreError {
    StoreError::Conflict(format!(
        "payment {} is {}, expected {}",
        payment.id, payment.status, expected
    ))
}

fn payout_conflict(payout: &Payout, expected: PayoutStatus) -> StoreError {
    StoreError::Conflict(format!(
        "payout {} is {}, expected {}",
        payout.id, payout.status, expected
    ))
}

/// Ledger store kept entirely in process memory
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored webhook delivery, for inspection
    pub async fn webhook_event(&self, external_id: &str) -> Option<WebhookEventRecord> {
        self.state.lock().await.webhook_events.get(external_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;

        let duplicate = state.payments.values().any(|p| {
            p.booking_id == payment.booking_id
                || p.processor_reference == payment.processor_reference
        });
        if duplicate || state.payments.contains_key(&payment.id) {
            return Err(StoreError::Conflict(format!(
                "booking {} already has a payment",
                payment.booking_id
            )));
        }

        state.payments.insert(payment.id, payment.clone());
        Ok(payment.clone())
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_reference(
        &self,
        processor_reference: &str,
    ) -> StoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.processor_reference == processor_reference)
            .cloned())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(id)?;
        if payment.status != from {
            return Err(payment_conflict(payment, from));
        }

        payment.status = to;
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn refund_payment(&self, id: Uuid) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        if state.has_payout_in(id, &[PayoutStatus::Pending, PayoutStatus::Processing]) {
            return Err(StoreError::Conflict(format!(
                "payment {} has a payout in flight",
                id
            )));
        }

        let payment = state.payment_mut(id)?;
        if payment.status != PaymentStatus::Escrow {
            return Err(payment_conflict(payment, PaymentStatus::Escrow));
        }

        payment.status = PaymentStatus::Refunded;
        payment.needs_review = false;
        payment.review_reason = None;
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn insert_payout(&self, payout: &Payout) -> StoreResult<Payout> {
        let mut state = self.state.lock().await;

        let payment = state.payment_mut(payout.payment_id)?;
        if payment.status != PaymentStatus::Escrow {
            return Err(payment_conflict(payment, PaymentStatus::Escrow));
        }

        if state.has_payout_in(
            payout.payment_id,
            &[
                PayoutStatus::Pending,
                PayoutStatus::Processing,
                PayoutStatus::Completed,
            ],
        ) {
            return Err(StoreError::Conflict(format!(
                "payment {} already has an active payout",
                payout.payment_id
            )));
        }

        let payment = state.payment_mut(payout.payment_id)?;
        payment.needs_review = false;
        payment.review_reason = None;
        payment.updated_at = Utc::now();

        state.payouts.insert(payout.id, payout.clone());
        Ok(payout.clone())
    }

    async fn get_payout(&self, id: Uuid) -> StoreResult<Option<Payout>> {
        Ok(self.state.lock().await.payouts.get(&id).cloned())
    }

    async fn find_payout_by_reference(&self, reference: &str) -> StoreResult<Option<Payout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .values()
            .find(|p| p.transfer_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn list_payouts_for_payment(&self, payment_id: Uuid) -> StoreResult<Vec<Payout>> {
        let state = self.state.lock().await;
        let mut payouts: Vec<Payout> = state
            .payouts
            .values()
            .filter(|p| p.payment_id == payment_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    async fn list_pending_payouts(&self) -> StoreResult<Vec<Payout>> {
        let state = self.state.lock().await;
        let mut payouts: Vec<Payout> = state
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Pending && !p.retries_halted)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    async fn claim_payout_attempt(&self, id: Uuid, reference: &str) -> StoreResult<Payout> {
        let mut state = self.state.lock().await;

        let reference_taken = state
            .payouts
            .values()
            .any(|p| p.transfer_reference.as_deref() == Some(reference));
        if reference_taken {
            return Err(StoreError::Conflict(format!(
                "transfer reference {} already used",
                reference
            )));
        }

        let payout = state.payout_mut(id)?;
        if payout.status != PayoutStatus::Pending {
            return Err(payout_conflict(payout, PayoutStatus::Pending));
        }
        if payout.retries_halted {
            return Err(StoreError::Conflict(format!(
                "payout {} has retries halted",
                payout.id
            )));
        }

        payout.status = PayoutStatus::Processing;
        payout.transfer_reference = Some(reference.to_string());
        payout.transfer_code = None;
        payout.recipient_code = None;
        payout.last_error = None;
        payout.updated_at = Utc::now();
        Ok(payout.clone())
    }

    async fn record_transfer(
        &self,
        id: Uuid,
        assignment: &TransferAssignment,
    ) -> StoreResult<Payout> {
        let mut state = self.state.lock().await;
        let payout = state.payout_mut(id)?;

        let holds_claim = payout.status == PayoutStatus::Processing
            && payout.transfer_reference.as_deref() == Some(assignment.reference.as_str());
        if !holds_claim {
            return Err(StoreError::Conflict(format!(
                "payout {} no longer holds the claim for {}",
                id, assignment.reference
            )));
        }

        payout.transfer_code = Some(assignment.transfer_code.clone());
        payout.recipient_code = Some(assignment.recipient_code.clone());
        payout.updated_at = Utc::now();
        Ok(payout.clone())
    }

    async fn list_unconfirmed_dispatches(&self) -> StoreResult<Vec<Payout>> {
        let state = self.state.lock().await;
        let mut payouts: Vec<Payout> = state
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Processing && p.transfer_code.is_none())
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    async fn flag_payment_for_review(&self, id: Uuid, reason: &str) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(id)?;
        if payment.status != PaymentStatus::Escrow {
            return Err(payment_conflict(payment, PaymentStatus::Escrow));
        }

        payment.needs_review = true;
        payment.review_reason = Some(reason.to_string());
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn requeue_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<Payout> {
        let mut state = self.state.lock().await;
        let payout = state.payout_mut(id)?;
        if payout.status != from {
            return Err(payout_conflict(payout, from));
        }

        payout.status = PayoutStatus::Pending;
        payout.attempts = attempts;
        payout.last_error = Some(error.to_string());
        payout.updated_at = Utc::now();
        Ok(payout.clone())
    }

    async fn complete_payout(&self, id: Uuid) -> StoreResult<(Payout, Payment)> {
        let mut state = self.state.lock().await;

        let payout = state.payout_mut(id)?;
        if payout.status != PayoutStatus::Processing {
            return Err(payout_conflict(payout, PayoutStatus::Processing));
        }
        let payment_id = payout.payment_id;

        let payment = state.payment_mut(payment_id)?;
        if payment.status != PaymentStatus::Escrow {
            return Err(payment_conflict(payment, PaymentStatus::Escrow));
        }

        // both checks passed, apply both writes
        let now = Utc::now();
        payment.status = PaymentStatus::Released;
        payment.needs_review = false;
        payment.review_reason = None;
        payment.updated_at = now;
        let payment = payment.clone();

        let payout = state.payout_mut(id)?;
        payout.status = PayoutStatus::Completed;
        payout.last_error = None;
        payout.updated_at = now;

        Ok((payout.clone(), payment))
    }

    async fn fail_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<(Payout, Payment)> {
        let mut state = self.state.lock().await;

        let payout = state.payout_mut(id)?;
        if payout.status != from {
            return Err(payout_conflict(payout, from));
        }
        let payment_id = payout.payment_id;
        if !state.payments.contains_key(&payment_id) {
            return Err(StoreError::NotFound(format!("payment {}", payment_id)));
        }

        let now = Utc::now();
        let payout = state.payout_mut(id)?;
        payout.status = PayoutStatus::Failed;
        payout.attempts = attempts;
        payout.last_error = Some(error.to_string());
        payout.updated_at = now;
        let payout = payout.clone();

        let payment = state.payment_mut(payment_id)?;
        payment.needs_review = true;
        payment.review_reason = Some(error.to_string());
        payment.updated_at = now;

        Ok((payout, payment.clone()))
    }

    async fn halt_payout_retries(&self, id: Uuid) -> StoreResult<Payout> {
        let mut state = self.state.lock().await;
        let payout = state.payout_mut(id)?;
        if payout.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "payout {} is already {}",
                payout.id, payout.status
            )));
        }

        payout.retries_halted = true;
        payout.updated_at = Utc::now();
        Ok(payout.clone())
    }

    async fn get_recipient(&self, provider_id: Uuid) -> StoreResult<Option<Recipient>> {
        Ok(self.state.lock().await.recipients.get(&provider_id).cloned())
    }

    async fn upsert_recipient(&self, recipient: &Recipient) -> StoreResult<Recipient> {
        let mut state = self.state.lock().await;

        let stored = match state.recipients.get(&recipient.provider_id) {
            Some(existing) if existing.same_destination(recipient) => Recipient {
                updated_at: Utc::now(),
                ..existing.clone()
            },
            Some(existing) => Recipient {
                recipient_code: None,
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..recipient.clone()
            },
            None => Recipient {
                recipient_code: None,
                ..recipient.clone()
            },
        };

        state.recipients.insert(stored.provider_id, stored.clone());
        Ok(stored)
    }

    async fn set_recipient_code(
        &self,
        snapshot: &Recipient,
        code: &str,
    ) -> StoreResult<Recipient> {
        let mut state = self.state.lock().await;
        let recipient = state
            .recipients
            .get_mut(&snapshot.provider_id)
            .ok_or_else(|| StoreError::NotFound(format!("recipient {}", snapshot.provider_id)))?;

        if !recipient.same_destination(snapshot) {
            return Err(StoreError::Conflict(format!(
                "payout destination for provider {} changed",
                snapshot.provider_id
            )));
        }

        if recipient.recipient_code.is_none() {
            recipient.recipient_code = Some(code.to_string());
            recipient.updated_at = Utc::now();
        }
        Ok(recipient.clone())
    }

    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        lease: Duration,
    ) -> StoreResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        match state.webhook_events.get_mut(&event.external_id) {
            Some(existing) => match existing.status {
                WebhookEventStatus::Processed => Ok(EventClaim::AlreadyProcessed),
                WebhookEventStatus::Received
                    if (now - existing.updated_at)
                        .to_std()
                        .map_or(true, |held| held <= lease) =>
                {
                    Ok(EventClaim::InFlight)
                }
                WebhookEventStatus::Received | WebhookEventStatus::Error => {
                    existing.status = WebhookEventStatus::Received;
                    existing.payload = event.payload.clone();
                    existing.error = None;
                    existing.updated_at = now;
                    Ok(EventClaim::Claimed)
                }
            },
            None => {
                state.webhook_events.insert(
                    event.external_id.clone(),
                    WebhookEventRecord {
                        external_id: event.external_id.clone(),
                        event_type: event.event_type.clone(),
                        status: WebhookEventStatus::Received,
                        payload: event.payload.clone(),
                        error: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(EventClaim::Claimed)
            }
        }
    }

    async fn complete_webhook_event(
        &self,
        external_id: &str,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .webhook_events
            .get_mut(external_id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {}", external_id)))?;

        record.status = match error {
            Some(_) => WebhookEventStatus::Error,
            None => WebhookEventStatus::Processed,
        };
        record.error = error.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn escrowed_payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            amount: Decimal::new(1000, 0),
            currency: "NGN".to_string(),
            status: PaymentStatus::Escrow,
            processor_reference: format!("bk_{}", Uuid::new_v4().simple()),
            escrow_amount: Decimal::new(900, 0),
            platform_fee: Decimal::new(100, 0),
            needs_review: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_second_active_payout_is_rejected() {
        let store = MemoryLedgerStore::new();
        let payment = store.insert_payment(&escrowed_payment()).await.unwrap();

        store
            .insert_payout(&Payout::for_payment(&payment))
            .await
            .unwrap();
        let second = store.insert_payout(&Payout::for_payment(&payment)).await;

        assert!(matches!(second, Err(StoreError::Conflict(_))));
        assert_eq!(
            store.list_payouts_for_payment(payment.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let store = MemoryLedgerStore::new();
        let payment = store.insert_payment(&escrowed_payment()).await.unwrap();
        let payout = store
            .insert_payout(&Payout::for_payment(&payment))
            .await
            .unwrap();

        let result = store.complete_payout(payout.id).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // nothing was written
        let payment = store.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Escrow);
    }

    #[tokio::test]
    async fn test_webhook_claim_is_check_and_set() {
        let store = MemoryLedgerStore::new();
        let event = NewWebhookEvent {
            external_id: "transfer.success:42".to_string(),
            event_type: "transfer.success".to_string(),
            payload: json!({"reference": "po_1"}),
        };

        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::Claimed
        );
        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::InFlight
        );

        store
            .complete_webhook_event(&event.external_id, Some("boom"))
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::Claimed
        );

        store
            .complete_webhook_event(&event.external_id, None)
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_abandoned_webhook_claim_expires() {
        let store = MemoryLedgerStore::new();
        let event = NewWebhookEvent {
            external_id: "transfer.success:43".to_string(),
            event_type: "transfer.success".to_string(),
            payload: json!({"reference": "po_2"}),
        };
        let lease = Duration::from_millis(20);

        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::Claimed
        );
        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::InFlight
        );

        // the first handler never finished
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::Claimed
        );
        let record = store.webhook_event(&event.external_id).await.unwrap();
        assert_eq!(record.status, WebhookEventStatus::Received);
    }

    #[tokio::test]
    async fn test_attempt_claim_is_exclusive() {
        let store = MemoryLedgerStore::new();
        let payment = store.insert_payment(&escrowed_payment()).await.unwrap();
        let payout = store
            .insert_payout(&Payout::for_payment(&payment))
            .await
            .unwrap();

        let claimed = store.claim_payout_attempt(payout.id, "po_a_1").await.unwrap();
        assert_eq!(claimed.status, PayoutStatus::Processing);
        assert_eq!(claimed.transfer_reference.as_deref(), Some("po_a_1"));
        assert_eq!(claimed.transfer_code, None);

        let second = store.claim_payout_attempt(payout.id, "po_a_2").await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));

        assert_eq!(
            store.list_unconfirmed_dispatches().await.unwrap().len(),
            1
        );

        let wrong = TransferAssignment {
            reference: "po_a_2".to_string(),
            transfer_code: "TRF_1".to_string(),
            recipient_code: "RCP_1".to_string(),
        };
        assert!(matches!(
            store.record_transfer(payout.id, &wrong).await,
            Err(StoreError::Conflict(_))
        ));

        let recorded = store
            .record_transfer(
                payout.id,
                &TransferAssignment {
                    reference: "po_a_1".to_string(),
                    ..wrong
                },
            )
            .await
            .unwrap();
        assert_eq!(recorded.transfer_code.as_deref(), Some("TRF_1"));
        assert!(store.list_unconfirmed_dispatches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_halted_payout_cannot_be_claimed() {
        let store = MemoryLedgerStore::new();
        let payment = store.insert_payment(&escrowed_payment()).await.unwrap();
        let payout = store
            .insert_payout(&Payout::for_payment(&payment))
            .await
            .unwrap();

        store.halt_payout_retries(payout.id).await.unwrap();
        let claim = store.claim_payout_attempt(payout.id, "po_b_1").await;
        assert!(matches!(claim, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_recipient_code_survives_same_destination_only() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let recipient = Recipient {
            provider_id: Uuid::new_v4(),
            bank_code: "058".to_string(),
            account_number: "0123456789".to_string(),
            account_name: "Ada Obi".to_string(),
            recipient_code: None,
            created_at: now,
            updated_at: now,
        };

        let stored = store.upsert_recipient(&recipient).await.unwrap();
        store.set_recipient_code(&stored, "RCP_1").await.unwrap();

        let same = store.upsert_recipient(&recipient).await.unwrap();
        assert_eq!(same.recipient_code.as_deref(), Some("RCP_1"));

        let moved = Recipient {
            account_number: "9876543210".to_string(),
            ..recipient.clone()
        };
        let changed = store.upsert_recipient(&moved).await.unwrap();
        assert_eq!(changed.recipient_code, None);

        // a code created for the old destination must not be cached
        let stale = store.set_recipient_code(&stored, "RCP_OLD").await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
    }
}
