//! A single transfer attempt for a payout

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::escrow::{
    EscrowError, EscrowLedger, EscrowResult, Payment, Payout, PayoutGuard, PayoutSettlement,
    Recipient, TransferAssignment,
};
use crate::gateway::{
    ExternalTransferStatus, FailureKind, GatewayError, RecipientDetails, TransferGateway,
    TransferInstruction,
};

/// What a call to `TransferDispatcher::attempt` did
#[derive(Debug)]
pub enum AttemptResult {
    /// The processor accepted the transfer; the payout is PROCESSING
    Initiated(Payout),
    /// The attempt failed synchronously and the failure was settled
    Settled(PayoutSettlement),
    /// The payout was no longer waiting for an attempt
    Skipped,
}

/// Fresh processor reference for one attempt of one payout
pub fn transfer_reference(payout_id: Uuid, attempt: i32) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("po_{}_{}_{}", payout_id.simple(), attempt, &nonce[..8])
}

pub struct TransferDispatcher {
    ledger: Arc<EscrowLedger>,
    gateway: Arc<dyn TransferGateway>,
    timeout: Duration,
}

impl TransferDispatcher {
    pub fn new(
        ledger: Arc<EscrowLedger>,
        gateway: Arc<dyn TransferGateway>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            timeout,
        }
    }

    /// Run one transfer attempt. The attempt is claimed in the store before
    /// the processor is called, so a second dispatcher sharing the store skips
    /// it. The payout's lock is held throughout, so an incoming webhook or
    /// manual override for it in this process waits until this returns.
    pub async fn attempt(&self, payout_id: Uuid) -> EscrowResult<AttemptResult> {
        let guard = self.ledger.lock_payout(payout_id).await;

        let (payout, payment) = match self.ledger.payout_for_attempt(&guard).await? {
            Some(found) => found,
            None => return Ok(AttemptResult::Skipped),
        };

        let attempt = payout.attempts + 1;
        let reference = transfer_reference(payout.id, attempt);
        let payout = match self.ledger.claim_attempt(&guard, &reference).await? {
            Some(claimed) => claimed,
            None => return Ok(AttemptResult::Skipped),
        };

        tracing::info!(
            payout_id = %payout.id,
            payment_id = %payment.id,
            attempt,
            reference = %reference,
            "Starting transfer attempt"
        );

        let recipient_code = match self.resolve_recipient(&payout).await {
            Ok(code) => code,
            Err(err) => return self.settle(&guard, err).await,
        };

        let instruction = TransferInstruction {
            recipient_code: recipient_code.clone(),
            amount: payout.amount,
            currency: payout.currency.clone(),
            reference,
            reason: transfer_reason(&payment),
        };

        let receipt = match self
            .with_timeout(self.gateway.create_transfer(&instruction))
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => return self.settle(&guard, EscrowError::Gateway(err)).await,
        };

        if receipt.status == ExternalTransferStatus::Otp {
            tracing::warn!(
                payout_id = %payout.id,
                transfer_code = %receipt.transfer_code,
                "Transfer awaits OTP finalization on the processor dashboard"
            );
        }

        let assignment = TransferAssignment {
            reference: instruction.reference,
            transfer_code: receipt.transfer_code,
            recipient_code,
        };
        match self.ledger.record_transfer(&guard, &assignment).await {
            Ok(payout) => Ok(AttemptResult::Initiated(payout)),
            Err(err) => {
                // still PROCESSING under the claimed reference; the processor's
                // webhook settles it and nothing is resent
                tracing::error!(
                    payout_id = %payout.id,
                    reference = %assignment.reference,
                    transfer_code = %assignment.transfer_code,
                    error = %err,
                    "Transfer accepted by processor but not recorded"
                );
                Ok(AttemptResult::Initiated(payout))
            }
        }
    }

    /// Processor recipient code for the payout's destination, created at most
    /// once per destination
    async fn resolve_recipient(&self, payout: &Payout) -> EscrowResult<String> {
        let _provider = self.ledger.lock_recipient(payout.provider_id).await;

        let recipient = self
            .ledger
            .recipient_for(payout.provider_id)
            .await?
            .ok_or_else(|| {
                EscrowError::Validation(format!(
                    "provider {} has no payout destination",
                    payout.provider_id
                ))
            })?;

        if let Some(code) = recipient.recipient_code.clone() {
            return Ok(code);
        }

        let code = self
            .with_timeout(
                self.gateway
                    .create_recipient(&recipient_details(&recipient, &payout.currency)),
            )
            .await?;

        let cached = self.ledger.cache_recipient_code(&recipient, &code).await?;
        Ok(cached.recipient_code.unwrap_or(code))
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Network(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }

    async fn settle(&self, guard: &PayoutGuard, err: EscrowError) -> EscrowResult<AttemptResult> {
        // nothing was sent under this claim, so a later attempt may try again
        let kind = err.failure_kind().unwrap_or(FailureKind::Retryable);

        tracing::warn!(
            payout_id = %guard.payout_id(),
            error = %err,
            kind = ?kind,
            "Transfer attempt failed"
        );

        let settlement = self
            .ledger
            .record_attempt_failure(guard, kind, &err.to_string())
            .await?;
        Ok(AttemptResult::Settled(settlement))
    }
}

fn transfer_reason(payment: &Payment) -> String {
    format!("Payout for booking {}", payment.booking_id)
}

fn recipient_details(recipient: &Recipient, currency: &str) -> RecipientDetails {
    RecipientDetails {
        bank_code: recipient.bank_code.clone(),
        account_number: recipient.account_number.clone(),
        account_name: recipient.account_name.clone(),
        currency: currency.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_reference_is_fresh_per_call() {
        let payout_id = Uuid::new_v4();
        let first = transfer_reference(payout_id, 1);
        let second = transfer_reference(payout_id, 1);

        assert_ne!(first, second);
        assert!(first.starts_with(&format!("po_{}_1_", payout_id.simple())));
        assert!(first.len() <= 50);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }
}
