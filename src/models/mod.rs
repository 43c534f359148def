//! Shared HTTP response models

use serde::{Deserialize, Serialize};

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Acknowledgement returned to the processor for every accepted delivery
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub outcome: String,
}
