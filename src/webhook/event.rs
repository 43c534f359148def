//! Typed webhook payloads
//!
//! Deliveries are parsed into `ProcessorEvent` at the boundary; nothing past
//! this module looks at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of every delivery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawWebhook {
    #[serde(default)]
    pub id: Option<Value>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl RawWebhook {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Stable identifier used for idempotency: the envelope id when present,
    /// else the event type joined with the data id or reference.
    pub fn event_id(&self) -> Option<String> {
        if let Some(id) = self.id.as_ref().and_then(scalar_to_string) {
            return Some(id);
        }

        ["id", "reference"]
            .iter()
            .filter_map(|key| self.data.get(*key).and_then(scalar_to_string))
            .map(|value| format!("{}:{}", self.event, value))
            .next()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferEventData {
    pub reference: String,
    #[serde(default)]
    pub transfer_code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub gateway_response: Option<String>,
}

impl TransferEventData {
    /// Human-readable cause of a failed or reversed transfer
    pub fn failure_reason(&self, event_type: &str) -> String {
        self.gateway_response
            .clone()
            .or_else(|| self.status.clone())
            .map(|detail| format!("{}: {}", event_type, detail))
            .unwrap_or_else(|| event_type.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChargeEventData {
    pub reference: String,
}

/// Processor events the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    TransferSuccess(TransferEventData),
    TransferFailed(TransferEventData),
    TransferReversed(TransferEventData),
    ChargeSuccess(ChargeEventData),
    Unrecognized(String),
}

impl ProcessorEvent {
    pub fn parse(event_type: &str, data: &Value) -> Result<Self, serde_json::Error> {
        let event = match event_type {
            "transfer.success" => ProcessorEvent::TransferSuccess(Deserialize::deserialize(data)?),
            "transfer.failed" => ProcessorEvent::TransferFailed(Deserialize::deserialize(data)?),
            "transfer.reversed" => {
                ProcessorEvent::TransferReversed(Deserialize::deserialize(data)?)
            }
            "charge.success" => ProcessorEvent::ChargeSuccess(Deserialize::deserialize(data)?),
            other => ProcessorEvent::Unrecognized(other.to_string()),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_prefers_envelope_id() {
        let raw: RawWebhook = serde_json::from_value(json!({
            "id": 9911,
            "event": "transfer.success",
            "data": {"id": 42, "reference": "po_1"}
        }))
        .unwrap();
        assert_eq!(raw.event_id().as_deref(), Some("9911"));
    }

    #[test]
    fn test_event_id_falls_back_to_data() {
        let raw: RawWebhook = serde_json::from_value(json!({
            "event": "transfer.failed",
            "data": {"id": 42, "reference": "po_1"}
        }))
        .unwrap();
        assert_eq!(raw.event_id().as_deref(), Some("transfer.failed:42"));

        let raw: RawWebhook = serde_json::from_value(json!({
            "event": "charge.success",
            "data": {"reference": "pay_1"}
        }))
        .unwrap();
        assert_eq!(raw.event_id().as_deref(), Some("charge.success:pay_1"));

        let raw: RawWebhook =
            serde_json::from_value(json!({"event": "transfer.success", "data": {}})).unwrap();
        assert_eq!(raw.event_id(), None);
    }

    #[test]
    fn test_parse_transfer_events() {
        let data = json!({
            "reference": "po_1",
            "transfer_code": "TRF_1",
            "status": "failed",
            "gateway_response": "Account could not be credited"
        });

        match ProcessorEvent::parse("transfer.failed", &data).unwrap() {
            ProcessorEvent::TransferFailed(event) => {
                assert_eq!(event.reference, "po_1");
                assert_eq!(
                    event.failure_reason("transfer.failed"),
                    "transfer.failed: Account could not be credited"
                );
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(
            ProcessorEvent::parse("transfer.reversed", &data).unwrap(),
            ProcessorEvent::TransferReversed(_)
        ));
    }

    #[test]
    fn test_unrecognized_event_is_not_an_error() {
        let event = ProcessorEvent::parse("subscription.create", &json!({})).unwrap();
        assert_eq!(
            event,
            ProcessorEvent::Unrecognized("subscription.create".to_string())
        );
    }

    #[test]
    fn test_transfer_event_requires_reference() {
        assert!(ProcessorEvent::parse("transfer.success", &json!({"id": 1})).is_err());
    }
}
