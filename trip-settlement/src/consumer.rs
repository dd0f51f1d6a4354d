//! Settlement consumer: turns completed-trip events into balance credits

use crate::balance::{BalanceStore, Credit, KvBackend};
use crate::error::StoreError;
use crate::event::TripCompletedEvent;
use crate::ledger::TripLedger;
use crate::metrics::{LEDGER_MARKS_TOTAL, SETTLEMENT_EVENTS_TOTAL, SETTLEMENT_EVENT_DURATION};
use async_trait::async_trait;
use message_bus::{Delivery, Disposition, MessageHandler};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fare credited; `balance` is the driver key's new value
    Settled { trip_id: String, balance: Decimal },
    /// The trip had already been credited
    Duplicate { trip_id: String },
    /// Payload can never be settled
    Malformed { reason: String },
    /// Well-formed event the balance cannot absorb
    Rejected { trip_id: String, reason: String },
    /// Store failure; redelivery may succeed
    Transient { reason: String },
}

impl Outcome {
    /// Broker treatment for the delivery
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Settled { .. } | Outcome::Duplicate { .. } => Disposition::Ack,
            Outcome::Malformed { .. } | Outcome::Rejected { .. } => Disposition::Drop,
            Outcome::Transient { .. } => Disposition::Retry,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Settled { .. } => "settled",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::Malformed { .. } => "malformed",
            Outcome::Rejected { .. } => "rejected",
            Outcome::Transient { .. } => "transient",
        }
    }
}

pub struct SettlementConsumer<B> {
    balances: Arc<BalanceStore<B>>,
    ledger: Arc<dyn TripLedger>,
}

impl<B: KvBackend> SettlementConsumer<B> {
    pub fn new(balances: Arc<BalanceStore<B>>, ledger: Arc<dyn TripLedger>) -> Self {
        Self { balances, ledger }
    }

    /// Settle one payload
    pub async fn process(&self, payload: &[u8]) -> Outcome {
        let start = Instant::now();
        let outcome = self.settle(payload).await;

        SETTLEMENT_EVENTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        SETTLEMENT_EVENT_DURATION.observe(start.elapsed().as_secs_f64());

        outcome
    }

    async fn settle(&self, payload: &[u8]) -> Outcome {
        let event = match TripCompletedEvent::from_slice(payload) {
            Ok(event) => event,
            Err(reason) => {
                warn!(
                    "Dropping malformed trip event: {} (payload: {})",
                    reason,
                    preview(payload)
                );
                return Outcome::Malformed {
                    reason: reason.to_string(),
                };
            }
        };

        let key = self.balances.balance_key(&event.driver_name);

        let outcome = match self
            .balances
            .credit_once(&key, &event.trip_id, event.fare_amount)
            .await
        {
            Ok(Credit::Applied { balance }) => {
                info!(
                    trip_id = %event.trip_id,
                    key = %key,
                    fare = %event.fare_amount,
                    balance = %balance,
                    "Driver balance credited"
                );
                Outcome::Settled {
                    trip_id: event.trip_id.clone(),
                    balance,
                }
            }
            Ok(Credit::Duplicate { .. }) => {
                info!(trip_id = %event.trip_id, key = %key, "Trip already credited, skipping");
                Outcome::Duplicate {
                    trip_id: event.trip_id.clone(),
                }
            }
            Err(e @ StoreError::Overflow { .. }) => {
                error!(
                    trip_id = %event.trip_id,
                    key = %key,
                    fare = %event.fare_amount,
                    "Dropping trip event: {}", e
                );
                return Outcome::Rejected {
                    trip_id: event.trip_id.clone(),
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                warn!(trip_id = %event.trip_id, key = %key, "Credit failed, requesting redelivery: {}", e);
                return Outcome::Transient {
                    reason: e.to_string(),
                };
            }
        };

        self.mark_processed(&event.trip_id).await;
        outcome
    }

    // The credit already stands, so a ledger failure only gets logged
    async fn mark_processed(&self, trip_id: &str) {
        match self.ledger.mark_processed(trip_id).await {
            Ok(true) => {
                LEDGER_MARKS_TOTAL.with_label_values(&["matched"]).inc();
            }
            Ok(false) => {
                LEDGER_MARKS_TOTAL.with_label_values(&["unmatched"]).inc();
                warn!(trip_id, "No trip record to mark processed");
            }
            Err(e) => {
                LEDGER_MARKS_TOTAL.with_label_values(&["error"]).inc();
                error!(trip_id, "Failed to mark trip processed: {}", e);
            }
        }
    }
}

#[async_trait]
impl<B: KvBackend> MessageHandler for SettlementConsumer<B> {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        if delivery.is_redelivery() {
            info!(attempt = delivery.attempt, "Redelivered trip event");
        }
        self.process(&delivery.payload).await.disposition()
    }
}

fn preview(payload: &[u8]) -> String {
    const MAX: usize = 256;
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= MAX {
        text.into_owned()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BalanceStoreConfig, MemoryBackend};
    use crate::error::{LedgerError, LedgerResult};
    use crate::ledger::MemoryTripLedger;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct DownLedger;

    #[async_trait]
    impl TripLedger for DownLedger {
        async fn mark_processed(&self, _trip_id: &str) -> LedgerResult<bool> {
            Err(LedgerError::Unavailable("connection refused".to_string()))
        }
    }

    fn balances() -> Arc<BalanceStore<MemoryBackend>> {
        Arc::new(BalanceStore::new(
            MemoryBackend::new(),
            BalanceStoreConfig::default(),
        ))
    }

    #[test]
    fn test_dispositions() {
        let settled = Outcome::Settled {
            trip_id: "c1".to_string(),
            balance: dec!(1),
        };
        assert_eq!(settled.disposition(), Disposition::Ack);
        assert_eq!(
            Outcome::Duplicate { trip_id: "c1".to_string() }.disposition(),
            Disposition::Ack
        );
        assert_eq!(
            Outcome::Malformed { reason: String::new() }.disposition(),
            Disposition::Drop
        );
        assert_eq!(
            Outcome::Rejected {
                trip_id: "c1".to_string(),
                reason: String::new()
            }
            .disposition(),
            Disposition::Drop
        );
        assert_eq!(
            Outcome::Transient { reason: String::new() }.disposition(),
            Disposition::Retry
        );
    }

    #[tokio::test]
    async fn test_settles_and_marks_trip() {
        let balances = balances();
        let ledger = Arc::new(MemoryTripLedger::new());
        ledger.insert(json!({"id_corrida": "corrida_1", "processada": false}));

        let consumer = SettlementConsumer::new(balances.clone(), ledger.clone());
        let payload = br#"{"id_corrida":"corrida_1","motorista":{"nome":"Joao"},"valor_corrida":15.0}"#;

        let outcome = consumer.process(payload).await;
        assert_eq!(
            outcome,
            Outcome::Settled {
                trip_id: "corrida_1".to_string(),
                balance: dec!(15.0),
            }
        );
        assert_eq!(ledger.get("corrida_1").unwrap()["processada"], json!(true));
    }

    #[tokio::test]
    async fn test_ledger_failure_still_acks() {
        let balances = balances();
        let consumer = SettlementConsumer::new(balances.clone(), Arc::new(DownLedger));
        let delivery = Delivery::new(
            "corridas_finalizadas",
            br#"{"id_corrida":"c2","motorista":{"nome":"Ana"},"valor_corrida":"8.25"}"#.to_vec(),
        );

        assert_eq!(consumer.handle(&delivery).await, Disposition::Ack);
        assert_eq!(balances.get_balance("saldo:Ana").await.unwrap(), dec!(8.25));
    }

    #[tokio::test]
    async fn test_malformed_is_dropped() {
        let balances = balances();
        let consumer = SettlementConsumer::new(balances.clone(), Arc::new(MemoryTripLedger::new()));
        let delivery = Delivery::new(
            "corridas_finalizadas",
            br#"{"motorista": {}, "valor_corrida": 10}"#.to_vec(),
        );

        assert_eq!(consumer.handle(&delivery).await, Disposition::Drop);
        assert!(balances.backend().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_balance_is_retried() {
        let balances = balances();
        balances.backend().set("saldo:Joao", "NaN?").await.unwrap();
        let consumer = SettlementConsumer::new(balances.clone(), Arc::new(MemoryTripLedger::new()));

        let outcome = consumer
            .process(br#"{"id_corrida":"c3","motorista":{"nome":"Joao"},"valor_corrida":1}"#)
            .await;
        assert_eq!(outcome.disposition(), Disposition::Retry);
    }

    #[tokio::test]
    async fn test_overflowing_credit_is_dropped() {
        let balances = balances();
        balances.set("saldo:Joao", Decimal::MAX).await.unwrap();
        let ledger = Arc::new(MemoryTripLedger::new());
        ledger.insert(json!({"id_corrida": "c1", "processada": false}));
        let consumer = Arc::new(SettlementConsumer::new(balances.clone(), ledger.clone()));

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .process(br#"{"id_corrida":"c1","motorista":{"nome":"Joao"},"valor_corrida":1}"#)
                    .await
            }
        });
        let outcome = handle.await.expect("handler task panicked");

        assert!(matches!(outcome, Outcome::Rejected { ref trip_id, .. } if trip_id == "c1"));
        assert_eq!(outcome.disposition(), Disposition::Drop);
        assert_eq!(balances.get_balance("saldo:Joao").await.unwrap(), Decimal::MAX);
        assert_eq!(ledger.get("c1").unwrap()["processada"], json!(false));
    }

    #[test]
    fn test_preview_truncates() {
        let long = vec![b'a'; 1000];
        assert_eq!(preview(&long).chars().count(), 257);
        assert_eq!(preview(b"{}"), "{}");
    }
}
