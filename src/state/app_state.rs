//! Application state shared across handlers

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::escrow::{EscrowLedger, LedgerSettings, LedgerStore};
use crate::gateway::TransferGateway;
use crate::payout::{RetryCoordinator, RetryQueue, RetryRequest, TransferDispatcher};
use crate::webhook::WebhookReconciler;
use crate::websocket::WsState;

use axum::extract::FromRef;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<EscrowLedger>,
    pub reconciler: Arc<WebhookReconciler>,
    pub coordinator: Arc<RetryCoordinator>,
    pub ws_state: WsState,
    pub webhook_secret: Arc<str>,
}

/// Settings needed to wire the services together
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub ledger: LedgerSettings,
    pub gateway_timeout: Duration,
    pub webhook_secret: String,
}

impl AppState {
    /// Wire ledger, dispatcher, coordinator and reconciler around a store and a
    /// gateway. The returned receiver must be handed to `RetryCoordinator::run`.
    pub fn assemble(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn TransferGateway>,
        settings: ServiceSettings,
    ) -> (Self, mpsc::UnboundedReceiver<RetryRequest>) {
        let ws_state = WsState::new();
        let (retry_queue, retry_rx) = RetryQueue::channel();
        let policy = settings.ledger.policy;

        let ledger = Arc::new(EscrowLedger::new(
            store,
            Arc::new(ws_state.clone()),
            retry_queue,
            settings.ledger,
        ));
        let dispatcher = Arc::new(TransferDispatcher::new(
            ledger.clone(),
            gateway,
            settings.gateway_timeout,
        ));
        let coordinator = Arc::new(RetryCoordinator::new(
            dispatcher,
            ledger.clone(),
            policy,
        ));
        let reconciler = Arc::new(WebhookReconciler::new(ledger.clone()));

        let state = Self {
            ledger,
            reconciler,
            coordinator,
            ws_state,
            webhook_secret: Arc::from(settings.webhook_secret.as_str()),
        };

        (state, retry_rx)
    }
}

impl FromRef<AppState> for WsState {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.ws_state.clone()
    }
}

impl FromRef<AppState> for Arc<EscrowLedger> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.ledger.clone()
    }
}
