//! Marketplace escrow service library
//!
//! Booking payments are held in escrow and paid out to providers through the
//! payment processor's transfer API, with retries and webhook reconciliation.

pub mod config;
pub mod db;
pub mod error;
pub mod escrow;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod payout;
pub mod routes;
pub mod state;
pub mod webhook;
pub mod websocket;
