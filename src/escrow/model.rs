//! Escrow models and data structures

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::gateway::money::has_minor_unit_precision;

/// Payment status. Moves forward only, see `EscrowLedger`.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,  // Booking payment initiated, charge not yet confirmed
    Escrow,   // Charge confirmed, funds held by the platform
    Released, // Paid out to the provider
    Refunded, // Returned to the payer
    Failed,   // Charge never succeeded
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Escrow => "ESCROW",
            PaymentStatus::Released => "RELEASED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payout status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,    // Waiting for a transfer attempt
    Processing, // Transfer initiated, waiting for the processor's verdict
    Completed,  // Provider paid
    Failed,     // Gave up; payment held for manual review
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Completed | PayoutStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment for a booking (one per booking)
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub provider_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub processor_reference: String, // Charge reference at the processor
    pub escrow_amount: Decimal,      // Portion owed to the provider
    pub platform_fee: Decimal,
    pub needs_review: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Escrow portion plus fee must add up to the charged amount, within one
    /// minor unit.
    pub fn split_is_consistent(&self) -> bool {
        (self.escrow_amount + self.platform_fee - self.amount).abs() <= Decimal::new(1, 2)
    }
}

/// Split an amount into (escrow portion, platform fee). The fee is rounded to
/// minor units and the escrow portion takes the remainder, so the two always
/// sum to the amount exactly.
pub fn split_amount(amount: Decimal, fee_percent: Decimal) -> (Decimal, Decimal) {
    let fee = (amount * fee_percent / Decimal::ONE_HUNDRED).round_dp(2);
    (amount - fee, fee)
}

/// Transfer of escrowed funds to a provider
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Payout {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub provider_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PayoutStatus,
    pub transfer_code: Option<String>,
    pub recipient_code: Option<String>,
    pub transfer_reference: Option<String>, // Reference of the latest attempt
    pub attempts: i32,                      // Failed attempts so far
    pub retries_halted: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    /// Fresh PENDING payout for the escrow portion of a payment
    pub fn for_payment(payment: &Payment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            provider_id: payment.provider_id,
            amount: payment.escrow_amount,
            currency: payment.currency.clone(),
            status: PayoutStatus::Pending,
            transfer_code: None,
            recipient_code: None,
            transfer_reference: None,
            attempts: 0,
            retries_halted: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Processor-side data written when a transfer attempt is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAssignment {
    pub reference: String,
    pub transfer_code: String,
    pub recipient_code: String,
}

/// Provider payout destination
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Recipient {
    pub provider_id: Uuid,
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
    pub recipient_code: Option<String>, // Cached after first creation
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Same bank destination as `other`
    pub fn same_destination(&self, other: &Recipient) -> bool {
        self.bank_code == other.bank_code
            && self.account_number == other.account_number
            && self.account_name == other.account_name
    }
}

/// Webhook processing status in the idempotency ledger
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "webhook_event_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Error,
}

/// Stored webhook delivery
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct WebhookEventRecord {
    pub external_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Webhook delivery to be claimed
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub external_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Result of the check-and-set on the idempotency ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This delivery owns the event and must apply it
    Claimed,
    /// Already applied earlier
    AlreadyProcessed,
    /// Another delivery of the same event is being applied right now
    InFlight,
}

fn validate_positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        return Err(ValidationError::new("amount_not_positive"));
    }
    if !has_minor_unit_precision(*amount) {
        return Err(ValidationError::new("amount_precision"));
    }
    Ok(())
}

fn validate_digits(value: &str) -> Result<(), ValidationError> {
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new("digits_only"));
    }
    Ok(())
}

/// Request DTO for creating a booking payment
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    pub booking_id: Uuid,
    pub provider_id: Uuid,
    #[validate(custom = "validate_positive_amount")]
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

/// Request DTO for registering a provider's bank destination
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRecipientRequest {
    #[validate(length(min = 1, max = 10))]
    pub bank_code: String,
    #[validate(length(equal = 10), custom = "validate_digits")]
    pub account_number: String,
    #[validate(length(min = 1, max = 100))]
    pub account_name: String,
}

/// Request DTO for failing a charge
#[derive(Debug, Deserialize)]
pub struct FailChargeRequest {
    pub reason: Option<String>,
}

/// Payment with every payout attempted for it
#[derive(Debug, Serialize)]
pub struct PaymentWithPayouts {
    #[serde(flatten)]
    pub payment: Payment,
    pub payouts: Vec<Payout>,
}

/// Escrow event types for real-time updates and operator follow-up
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum EscrowEvent {
    PaymentCreated {
        payment_id: Uuid,
        booking_id: Uuid,
    },
    PaymentEscrowed {
        payment_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        reason: String,
    },
    PaymentRefunded {
        payment_id: Uuid,
    },
    PaymentReleased {
        payment_id: Uuid,
        payout_id: Uuid,
    },
    PayoutRequested {
        payment_id: Uuid,
        payout_id: Uuid,
    },
    PayoutProcessing {
        payment_id: Uuid,
        payout_id: Uuid,
        reference: String,
        attempt: i32,
    },
    PayoutRetryScheduled {
        payment_id: Uuid,
        payout_id: Uuid,
        attempt: i32,
        delay_ms: u64,
    },
    PayoutCompleted {
        payment_id: Uuid,
        payout_id: Uuid,
    },
    PayoutFailed {
        payment_id: Uuid,
        payout_id: Uuid,
        attempts: i32,
        reason: String,
    },
    ManualReviewRequired {
        payment_id: Uuid,
        payout_id: Uuid,
        reason: String,
    },
}

impl EscrowEvent {
    /// Payment the event belongs to, used for subscription filtering
    pub fn payment_id(&self) -> Uuid {
        match self {
            EscrowEvent::PaymentCreated { payment_id, .. }
            | EscrowEvent::PaymentEscrowed { payment_id }
            | EscrowEvent::PaymentFailed { payment_id, .. }
            | EscrowEvent::PaymentRefunded { payment_id }
            | EscrowEvent::PaymentReleased { payment_id, .. }
            | EscrowEvent::PayoutRequested { payment_id, .. }
            | EscrowEvent::PayoutProcessing { payment_id, .. }
            | EscrowEvent::PayoutRetryScheduled { payment_id, .. }
            | EscrowEvent::PayoutCompleted { payment_id, .. }
            | EscrowEvent::PayoutFailed { payment_id, .. }
            | EscrowEvent::ManualReviewRequired { payment_id, .. } => *payment_id,
        }
    }
}

/// Fire-and-forget publication of escrow events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EscrowEvent);
}
