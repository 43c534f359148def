//! Escrow domain module
//!
//! Payment and payout records, their state machine, and the stores that
//! persist them.

mod error;
mod ledger;
mod locks;
mod memory_store;
mod model;
mod pg_store;
mod store;

pub use error::{EscrowError, EscrowResult, StoreError, StoreResult};
pub use ledger::{EscrowLedger, LedgerSettings, PayoutSettlement, TransferOutcome};
pub use locks::{KeyGuard, PayoutGuard};
pub use memory_store::MemoryLedgerStore;
pub use model::*;
pub use pg_store::PgLedgerStore;
pub use store::LedgerStore;
