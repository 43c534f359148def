//! Paystack transfer API client

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::money::to_minor_units;
use super::{
    ExternalTransferStatus, GatewayError, RecipientDetails, TransferGateway, TransferInstruction,
    TransferReceipt,
};

/// Configuration for the Paystack client
#[derive(Debug, Clone)]
pub struct PaystackConfig {
    pub secret_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

/// Paystack API client
#[derive(Clone)]
pub struct PaystackGateway {
    config: Arc<PaystackConfig>,
    http_client: Client,
}

/// Every Paystack response is wrapped in this envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct CreateRecipientBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    account_number: &'a str,
    bank_code: &'a str,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecipientData {
    recipient_code: String,
}

#[derive(Debug, Serialize)]
struct CreateTransferBody<'a> {
    source: &'static str,
    amount: i64,
    recipient: &'a str,
    reference: &'a str,
    reason: &'a str,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    transfer_code: String,
    status: ExternalTransferStatus,
}

impl PaystackGateway {
    /// Create a new client. The timeout bounds every request end to end.
    pub fn new(config: PaystackConfig) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(GatewayError::from_transport)?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
        })
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .json(body)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;

        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(GatewayError::from_transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.message)
                .unwrap_or(body);

            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;

        if !envelope.status {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "request was not accepted".to_string()),
            });
        }

        envelope
            .data
            .ok_or_else(|| GatewayError::Decode("response carried no data".to_string()))
    }
}

fn require(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[async_trait]
impl TransferGateway for PaystackGateway {
    async fn create_recipient(&self, details: &RecipientDetails) -> Result<String, GatewayError> {
        require("bank_code", &details.bank_code)?;
        require("account_number", &details.account_number)?;
        require("account_name", &details.account_name)?;

        let body = CreateRecipientBody {
            kind: "nuban",
            name: &details.account_name,
            account_number: &details.account_number,
            bank_code: &details.bank_code,
            currency: &details.currency,
        };

        let data: RecipientData = self.post("/transferrecipient", &body).await?;

        tracing::info!(
            bank_code = %details.bank_code,
            recipient_code = %data.recipient_code,
            "Transfer recipient created"
        );

        Ok(data.recipient_code)
    }

    async fn create_transfer(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, GatewayError> {
        require("recipient_code", &instruction.recipient_code)?;
        require("reference", &instruction.reference)?;
        let amount = to_minor_units(instruction.amount)?;

        let body = CreateTransferBody {
            source: "balance",
            amount,
            recipient: &instruction.recipient_code,
            reference: &instruction.reference,
            reason: &instruction.reason,
            currency: &instruction.currency,
        };

        let data: TransferData = self.post("/transfer", &body).await?;

        tracing::info!(
            reference = %instruction.reference,
            transfer_code = %data.transfer_code,
            status = ?data.status,
            amount_minor = amount,
            "Transfer initiated"
        );

        Ok(TransferReceipt {
            transfer_code: data.transfer_code,
            status: data.status,
        })
    }
}
