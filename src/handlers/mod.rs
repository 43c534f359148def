//! API handlers for the escrow service

mod health;
mod payments;
mod payouts;
mod webhook;

pub use health::{health_check, HealthResponse};
pub use payments::*;
pub use payouts::*;
pub use webhook::paystack_webhook;
