//! Processor webhook handling

mod event;
mod reconciler;
mod signature;

pub use event::{ChargeEventData, ProcessorEvent, RawWebhook, TransferEventData};
pub use reconciler::{Reconciled, WebhookReconciler};
pub use signature::{sign_payload, verify_signature, SignatureError, SIGNATURE_HEADER};
