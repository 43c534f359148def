//! Transfer gateway client
//!
//! Thin boundary around the payout processor. Only two remote operations are
//! consumed: registering a transfer recipient and initiating a transfer. All
//! decimal/minor-unit conversion happens inside this module.

pub mod money;
mod paystack;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use paystack::{PaystackConfig, PaystackGateway};

/// How a failed transfer attempt should be treated by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Terminal,
}

/// Gateway failure, classified at the boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid transfer input: {0}")]
    Validation(String),

    #[error("Network failure talking to processor: {0}")]
    Network(String),

    #[error("Processor rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unreadable processor response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Network failures, 5xx responses, request timeouts (408) and rate
    /// limiting (429) are worth another attempt. Other 4xx rejections are
    /// terminal, and so are bodies we cannot read: if the processor may have
    /// accepted the transfer we must not send it again.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GatewayError::Network(_) => FailureKind::Retryable,
            GatewayError::Rejected { status, .. } if *status >= 500 => FailureKind::Retryable,
            GatewayError::Rejected {
                status: 408 | 429, ..
            } => FailureKind::Retryable,
            _ => FailureKind::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Retryable
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            // timeouts, refused connections and dropped bodies all land here
            GatewayError::Network(err.to_string())
        }
    }
}

/// Bank destination to register with the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientDetails {
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
    pub currency: String,
}

/// A single transfer attempt. `reference` must be fresh for every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInstruction {
    pub recipient_code: String,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    pub reason: String,
}

/// Transfer status as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExternalTransferStatus {
    Pending,
    Otp,
    Received,
    Success,
    Failed,
    Reversed,
    Unknown(String),
}

impl From<String> for ExternalTransferStatus {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "pending" => ExternalTransferStatus::Pending,
            "otp" => ExternalTransferStatus::Otp,
            "received" => ExternalTransferStatus::Received,
            "success" => ExternalTransferStatus::Success,
            "failed" => ExternalTransferStatus::Failed,
            "reversed" => ExternalTransferStatus::Reversed,
            _ => ExternalTransferStatus::Unknown(value),
        }
    }
}

impl From<ExternalTransferStatus> for String {
    fn from(value: ExternalTransferStatus) -> Self {
        match value {
            ExternalTransferStatus::Pending => "pending".to_string(),
            ExternalTransferStatus::Otp => "otp".to_string(),
            ExternalTransferStatus::Received => "received".to_string(),
            ExternalTransferStatus::Success => "success".to_string(),
            ExternalTransferStatus::Failed => "failed".to_string(),
            ExternalTransferStatus::Reversed => "reversed".to_string(),
            ExternalTransferStatus::Unknown(raw) => raw,
        }
    }
}

/// Result of a successfully initiated transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_code: String,
    pub status: ExternalTransferStatus,
}

/// Operations the payout pipeline needs from the processor
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Register a bank destination, returning the processor recipient code
    async fn create_recipient(&self, details: &RecipientDetails) -> Result<String, GatewayError>;

    /// Initiate a transfer from the platform balance to a registered recipient
    async fn create_transfer(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            GatewayError::Network("timed out".to_string()).failure_kind(),
            FailureKind::Retryable
        );
        assert_eq!(
            GatewayError::Rejected {
                status: 502,
                message: "bad gateway".to_string()
            }
            .failure_kind(),
            FailureKind::Retryable
        );
        assert_eq!(
            GatewayError::Rejected {
                status: 400,
                message: "Invalid account number".to_string()
            }
            .failure_kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            GatewayError::Validation("empty".to_string()).failure_kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            GatewayError::Decode("eof".to_string()).failure_kind(),
            FailureKind::Terminal
        );
    }

    #[test]
    fn test_throttled_and_timed_out_requests_are_retryable() {
        for status in [408, 429] {
            let err = GatewayError::Rejected {
                status,
                message: "try again later".to_string(),
            };
            assert_eq!(err.failure_kind(), FailureKind::Retryable, "status {}", status);
        }

        for status in [401, 404, 409, 422] {
            let err = GatewayError::Rejected {
                status,
                message: "rejected".to_string(),
            };
            assert_eq!(err.failure_kind(), FailureKind::Terminal, "status {}", status);
        }
    }

    #[test]
    fn test_external_status_parsing() {
        let status: ExternalTransferStatus = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(status, ExternalTransferStatus::Success);

        let status: ExternalTransferStatus = serde_json::from_str("\"abandoned\"").unwrap();
        assert_eq!(
            status,
            ExternalTransferStatus::Unknown("abandoned".to_string())
        );
    }
}
