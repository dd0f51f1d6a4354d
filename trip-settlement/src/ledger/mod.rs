//! Trip ledger: the document store holding trip records

pub mod memory;
pub mod postgres;

pub use memory::MemoryTripLedger;
pub use postgres::{LedgerConfig, PgTripLedger};

use crate::error::LedgerResult;
use async_trait::async_trait;

/// Processed flags the settlement consumer owns on a trip record
pub const PROCESSED_FIELD: &str = "processada";
pub const BALANCE_UPDATED_FIELD: &str = "saldo_atualizado";

#[async_trait]
pub trait TripLedger: Send + Sync {
    /// Set `processada` and `saldo_atualizado` on the trip `trip_id`.
    /// Returns whether a record matched. Repeating the call changes nothing.
    async fn mark_processed(&self, trip_id: &str) -> LedgerResult<bool>;
}
