//! Webhook reconciler: processor callbacks in, ledger transitions out

use std::sync::Arc;

use serde_json::Value;

use super::event::ProcessorEvent;
use crate::escrow::{
    EscrowError, EscrowLedger, EscrowResult, EventClaim, NewWebhookEvent, Payment,
    PayoutSettlement, TransferOutcome,
};
use crate::gateway::FailureKind;

/// What handling a delivery did
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// A transfer outcome was applied to its payout
    Applied(PayoutSettlement),
    /// A charge confirmation moved its payment into escrow
    PaymentConfirmed(Payment),
    /// The event was already handled, or another handler holds its claim
    Duplicate,
    /// Recorded, but the event type drives no transition
    Ignored(String),
}

pub struct WebhookReconciler {
    ledger: Arc<EscrowLedger>,
}

impl WebhookReconciler {
    pub fn new(ledger: Arc<EscrowLedger>) -> Self {
        Self { ledger }
    }

    /// Handle one delivery. Callers must have verified its signature.
    pub async fn handle(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> EscrowResult<Reconciled> {
        let claim = self
            .ledger
            .claim_webhook_event(&NewWebhookEvent {
                external_id: event_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
            })
            .await?;

        if claim != EventClaim::Claimed {
            tracing::info!(event_id, event_type, claim = ?claim, "Duplicate webhook delivery skipped");
            return Ok(Reconciled::Duplicate);
        }

        let result = self.apply(event_type, payload).await;

        let error = result.as_ref().err().map(|err| err.to_string());
        if let Some(detail) = &error {
            tracing::error!(event_id, event_type, error = %detail, "Webhook reconciliation failed");
        }

        // if this write fails the claim lapses after the lease and a
        // redelivery applies the event again
        self.ledger
            .finish_webhook_event(event_id, error.as_deref())
            .await?;

        result
    }

    async fn apply(&self, event_type: &str, payload: &Value) -> EscrowResult<Reconciled> {
        let event = ProcessorEvent::parse(event_type, payload).map_err(|e| {
            EscrowError::Validation(format!("malformed {} payload: {}", event_type, e))
        })?;

        match event {
            ProcessorEvent::TransferSuccess(data) => {
                self.apply_outcome(&data.reference, TransferOutcome::Success)
                    .await
            }
            ProcessorEvent::TransferFailed(data) | ProcessorEvent::TransferReversed(data) => {
                let outcome = TransferOutcome::Failure {
                    kind: FailureKind::Retryable,
                    reason: data.failure_reason(event_type),
                };
                self.apply_outcome(&data.reference, outcome).await
            }
            ProcessorEvent::ChargeSuccess(data) => {
                let payment = self
                    .ledger
                    .confirm_charge_by_reference(&data.reference)
                    .await?;
                Ok(Reconciled::PaymentConfirmed(payment))
            }
            ProcessorEvent::Unrecognized(kind) => {
                tracing::info!(event_type = %kind, "Webhook event type ignored");
                Ok(Reconciled::Ignored(kind))
            }
        }
    }

    async fn apply_outcome(
        &self,
        reference: &str,
        outcome: TransferOutcome,
    ) -> EscrowResult<Reconciled> {
        // only the latest attempt's reference is stored, so outcomes for
        // superseded attempts find nothing
        let payout = self
            .ledger
            .find_payout_by_reference(reference)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("payout with reference {}", reference)))?;

        tracing::info!(
            payout_id = %payout.id,
            reference,
            outcome = ?outcome,
            "Applying transfer outcome"
        );

        let settlement = self
            .ledger
            .apply_transfer_outcome(payout.id, outcome)
            .await?;
        Ok(Reconciled::Applied(settlement))
    }
}
