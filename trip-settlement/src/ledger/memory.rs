//! In-memory trip ledger

use super::{TripLedger, BALANCE_UPDATED_FIELD, PROCESSED_FIELD};
use crate::error::LedgerResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

/// Trip documents keyed by `id_corrida`
#[derive(Debug, Default)]
pub struct MemoryTripLedger {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryTripLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a trip document. Documents without a string `id_corrida` are ignored.
    pub fn insert(&self, document: Value) -> bool {
        let Some(id) = document.get("id_corrida").and_then(Value::as_str) else {
            return false;
        };
        self.documents.lock().insert(id.to_string(), document);
        true
    }

    pub fn get(&self, trip_id: &str) -> Option<Value> {
        self.documents.lock().get(trip_id).cloned()
    }
}

#[async_trait]
impl TripLedger for MemoryTripLedger {
    async fn mark_processed(&self, trip_id: &str) -> LedgerResult<bool> {
        let mut documents = self.documents.lock();
        let Some(Value::Object(document)) = documents.get_mut(trip_id) else {
            return Ok(false);
        };

        document.insert(PROCESSED_FIELD.to_string(), Value::Bool(true));
        document.insert(BALANCE_UPDATED_FIELD.to_string(), Value::Bool(true));
        Ok(true)
    }
}
