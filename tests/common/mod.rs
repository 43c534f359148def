//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use marketplace_escrow_server::escrow::{
    CreatePaymentRequest, EscrowEvent, EscrowLedger, EventSink, LedgerSettings,
    MemoryLedgerStore, Payment, RegisterRecipientRequest,
};
use marketplace_escrow_server::gateway::{
    ExternalTransferStatus, GatewayError, RecipientDetails, TransferGateway, TransferInstruction,
    TransferReceipt,
};
use marketplace_escrow_server::payout::{RetryQueue, RetryRequest, TransferDispatcher};
use marketplace_escrow_server::webhook::WebhookReconciler;

/// Scripted reply for the next `create_transfer` call
pub enum TransferReply {
    Accept,
    Fail(GatewayError),
    Hang,
}

/// In-process gateway that replays scripted replies and records every call
#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<TransferReply>>,
    transfers: Mutex<Vec<TransferInstruction>>,
    recipients: Mutex<Vec<RecipientDetails>>,
    latency: Duration,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call answers only after `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn respond_slowly(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn push(&self, reply: TransferReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn transfers(&self) -> Vec<TransferInstruction> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn recipient_calls(&self) -> usize {
        self.recipients.lock().unwrap().len()
    }
}

#[async_trait]
impl TransferGateway for ScriptedGateway {
    async fn create_recipient(&self, details: &RecipientDetails) -> Result<String, GatewayError> {
        let count = {
            let mut recipients = self.recipients.lock().unwrap();
            recipients.push(details.clone());
            recipients.len()
        };
        self.respond_slowly().await;
        Ok(format!("RCP_{}", count))
    }

    async fn create_transfer(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, GatewayError> {
        let (reply, count) = {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push(instruction.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TransferReply::Accept);
            (reply, transfers.len())
        };
        self.respond_slowly().await;

        match reply {
            TransferReply::Accept => Ok(TransferReceipt {
                transfer_code: format!("TRF_{}", count),
                status: ExternalTransferStatus::Pending,
            }),
            TransferReply::Fail(err) => Err(err),
            TransferReply::Hang => std::future::pending().await,
        }
    }
}

/// Event sink that keeps everything published
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EscrowEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<EscrowEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EscrowEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: EscrowEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Ledger, dispatcher and reconciler over an in-memory store. The retry
/// channel is left unconsumed so tests can inspect what was scheduled.
pub struct Harness {
    pub store: MemoryLedgerStore,
    pub ledger: Arc<EscrowLedger>,
    pub dispatcher: Arc<TransferDispatcher>,
    pub reconciler: WebhookReconciler,
    pub gateway: Arc<ScriptedGateway>,
    pub sink: Arc<RecordingSink>,
    pub retry_rx: mpsc::UnboundedReceiver<RetryRequest>,
}

pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

impl Harness {
    pub fn new() -> Self {
        Self::with(
            MemoryLedgerStore::new(),
            Arc::new(ScriptedGateway::new()),
            LedgerSettings::default(),
        )
    }

    /// A separate ledger and dispatcher over `store`, the way a second
    /// server instance sharing the database would run
    pub fn with(
        store: MemoryLedgerStore,
        gateway: Arc<ScriptedGateway>,
        settings: LedgerSettings,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let (queue, retry_rx) = RetryQueue::channel();

        let ledger = Arc::new(EscrowLedger::new(
            Arc::new(store.clone()),
            sink.clone(),
            queue,
            settings,
        ));
        let dispatcher = Arc::new(TransferDispatcher::new(
            ledger.clone(),
            gateway.clone(),
            GATEWAY_TIMEOUT,
        ));
        let reconciler = WebhookReconciler::new(ledger.clone());

        Self {
            store,
            ledger,
            dispatcher,
            reconciler,
            gateway,
            sink,
            retry_rx,
        }
    }

    /// Payment of 1000 NGN with its charge confirmed and a payout destination
    /// registered for the provider
    pub async fn escrowed_payment(&self) -> Payment {
        self.escrowed_payment_for(Uuid::new_v4()).await
    }

    pub async fn escrowed_payment_for(&self, provider_id: Uuid) -> Payment {
        self.ledger
            .register_recipient(provider_id, recipient_request())
            .await
            .unwrap();

        let payment = self
            .ledger
            .create_payment(payment_request(provider_id))
            .await
            .unwrap();
        self.ledger.confirm_charge(payment.id).await.unwrap()
    }

    /// Drain everything scheduled so far
    pub fn scheduled(&mut self) -> Vec<RetryRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.retry_rx.try_recv() {
            requests.push(request);
        }
        requests
    }
}

pub fn payment_request(provider_id: Uuid) -> CreatePaymentRequest {
    CreatePaymentRequest {
        booking_id: Uuid::new_v4(),
        provider_id,
        amount: Decimal::new(1000, 0),
        currency: None,
    }
}

pub fn recipient_request() -> RegisterRecipientRequest {
    RegisterRecipientRequest {
        bank_code: "058".to_string(),
        account_number: "0123456789".to_string(),
        account_name: "Ada Obi".to_string(),
    }
}
