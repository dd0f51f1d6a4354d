//! PostgreSQL trip ledger
//!
//! Trip records are JSONB documents in a single column:
//!
//! ```sql
//! CREATE TABLE corridas (documento JSONB NOT NULL);
//! CREATE UNIQUE INDEX corridas_id_corrida ON corridas ((documento->>'id_corrida'));
//! ```

use super::{TripLedger, BALANCE_UPDATED_FIELD, PROCESSED_FIELD};
use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the trip ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub url: String,
    pub table: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

pub struct PgTripLedger {
    pool: PgPool,
    mark_sql: String,
    statement_timeout: Duration,
}

impl PgTripLedger {
    /// Build the pool without connecting; connections open on first use
    pub fn connect(config: &LedgerConfig) -> LedgerResult<Self> {
        if !is_valid_table_name(&config.table) {
            return Err(LedgerError::Rejected(format!(
                "invalid table name: {}",
                config.table
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.url)?;

        info!("Trip ledger using table {}", config.table);

        Ok(Self {
            pool,
            mark_sql: mark_processed_sql(&config.table),
            statement_timeout: config.statement_timeout,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TripLedger for PgTripLedger {
    async fn mark_processed(&self, trip_id: &str) -> LedgerResult<bool> {
        let update = sqlx::query(&self.mark_sql).bind(trip_id).execute(&self.pool);

        let result = tokio::time::timeout(self.statement_timeout, update)
            .await
            .map_err(|_| {
                LedgerError::Unavailable(format!(
                    "update timed out after {}ms",
                    self.statement_timeout.as_millis()
                ))
            })??;

        debug!(trip_id, rows = result.rows_affected(), "Marked trip processed");
        Ok(result.rows_affected() > 0)
    }
}

fn mark_processed_sql(table: &str) -> String {
    format!(
        "UPDATE {table} SET documento = documento || jsonb_build_object('{PROCESSED_FIELD}', true, '{BALANCE_UPDATED_FIELD}', true) \
         WHERE documento->>'id_corrida' = $1"
    )
}

/// Plain or schema-qualified SQL identifier
pub fn is_valid_table_name(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let starts_ok = chars
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
        if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
    }
    parts <= 2
}
