//! Trip settlement
//!
//! Consumes completed-trip events from NATS JetStream and credits each
//! driver's running balance in Redis exactly once, then flags the trip record
//! in PostgreSQL as processed. A reconciler folds balance keys that differ
//! only in driver-name casing into one canonical key.
//!
//! - [`balance`] - balance store with optimistic transactions
//! - [`ledger`] - trip ledger adapter
//! - [`consumer`] - per-event settlement and broker disposition
//! - [`reconciler`] - case-variant balance key merging
//! - [`server`] - Prometheus scrape endpoint

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod amount;
pub mod balance;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod ledger;
pub mod metrics;
pub mod reconciler;
pub mod server;
pub mod telemetry;

pub use balance::{
    BalanceStore, BalanceStoreConfig, Credit, KvBackend, MemoryBackend, RedisBackend, RetryPolicy,
};
pub use consumer::{Outcome, SettlementConsumer};
pub use error::{Error, LedgerError, Result, StoreError};
pub use event::{MalformedEvent, TripCompletedEvent, TRIP_COMPLETED_SUBJECT};
pub use ledger::{MemoryTripLedger, PgTripLedger, TripLedger};
pub use reconciler::{Reconciler, ReconciliationReport};
