//! Completed-trip events as published on `corridas_finalizadas`

use crate::amount::parse_decimal;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Subject completed trips are published on
pub const TRIP_COMPLETED_SUBJECT: &str = "corridas_finalizadas";

/// Reasons a payload cannot be settled. None of them improve on redelivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEvent {
    #[error("payload is not a trip document: {0}")]
    InvalidJson(String),

    #[error("missing or empty id_corrida")]
    MissingTripId,

    #[error("missing or empty motorista.nome")]
    MissingDriverName,

    #[error("missing valor_corrida")]
    MissingFare,

    #[error("valor_corrida is not a decimal: {0}")]
    InvalidFare(String),

    #[error("valor_corrida is negative: {0}")]
    NegativeFare(Decimal),
}

/// A validated completed-trip event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripCompletedEvent {
    /// Unique trip id (`id_corrida`)
    pub trip_id: String,

    /// Driver name exactly as the producer wrote it (`motorista.nome`)
    pub driver_name: String,

    /// Fare credited to the driver (`valor_corrida`)
    pub fare_amount: Decimal,
}

// The producer sends the whole trip document; only these fields matter here.
#[derive(Deserialize)]
struct WireTrip {
    #[serde(default)]
    id_corrida: Option<Value>,
    #[serde(default)]
    motorista: Option<WireDriver>,
    #[serde(default)]
    valor_corrida: Option<Value>,
}

#[derive(Deserialize)]
struct WireDriver {
    #[serde(default)]
    nome: Option<Value>,
}

impl TripCompletedEvent {
    /// Parse and validate a broker payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, MalformedEvent> {
        let wire: WireTrip = serde_json::from_slice(payload)
            .map_err(|e| MalformedEvent::InvalidJson(e.to_string()))?;

        let trip_id = match wire.id_corrida {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            _ => return Err(MalformedEvent::MissingTripId),
        };

        let driver_name = match wire.motorista.and_then(|m| m.nome) {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            _ => return Err(MalformedEvent::MissingDriverName),
        };

        let fare_amount = parse_fare(wire.valor_corrida)?;

        Ok(Self {
            trip_id,
            driver_name,
            fare_amount,
        })
    }
}

fn parse_fare(raw: Option<Value>) -> Result<Decimal, MalformedEvent> {
    let fare = match raw {
        None | Some(Value::Null) => return Err(MalformedEvent::MissingFare),
        Some(Value::Number(n)) => parse_decimal(&n.to_string()),
        Some(Value::String(s)) => parse_decimal(&s),
        Some(other) => return Err(MalformedEvent::InvalidFare(other.to_string())),
    };

    match fare {
        Some(fare) if fare.is_sign_negative() && !fare.is_zero() => {
            Err(MalformedEvent::NegativeFare(fare))
        }
        Some(fare) => Ok(fare),
        None => Err(MalformedEvent::InvalidFare(
            "unparsable amount".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_full_trip_document() {
        let payload = br#"{
            "id_corrida": "corrida_1",
            "passageiro": {"nome": "Ana", "telefone": "11999990000"},
            "motorista": {"nome": "Joao", "nota": 4.8},
            "origem": "Centro",
            "destino": "Aeroporto",
            "valor_corrida": 15.0
        }"#;

        let event = TripCompletedEvent::from_slice(payload).unwrap();
        assert_eq!(event.trip_id, "corrida_1");
        assert_eq!(event.driver_name, "Joao");
        assert_eq!(event.fare_amount, dec!(15.0));
    }

    #[test]
    fn test_driver_name_kept_raw() {
        let payload = br#"{"id_corrida":"c2","motorista":{"nome":"jOAO"},"valor_corrida":1}"#;
        let event = TripCompletedEvent::from_slice(payload).unwrap();
        assert_eq!(event.driver_name, "jOAO");
    }

    #[test]
    fn test_fare_as_numeric_string() {
        let payload = br#"{"id_corrida":"c3","motorista":{"nome":"Carla"},"valor_corrida":"42.35"}"#;
        let event = TripCompletedEvent::from_slice(payload).unwrap();
        assert_eq!(event.fare_amount, dec!(42.35));
    }

    #[test]
    fn test_fare_keeps_decimal_digits() {
        let payload = br#"{"id_corrida":"c4","motorista":{"nome":"Carla"},"valor_corrida":0.1}"#;
        let event = TripCompletedEvent::from_slice(payload).unwrap();
        assert_eq!(event.fare_amount, dec!(0.1));
    }

    #[test]
    fn test_zero_fare_accepted() {
        let payload = br#"{"id_corrida":"c5","motorista":{"nome":"Carla"},"valor_corrida":-0.0}"#;
        let event = TripCompletedEvent::from_slice(payload).unwrap();
        assert!(event.fare_amount.is_zero());
    }

    #[test]
    fn test_missing_trip_id() {
        let payload = br#"{"motorista":{"nome":"Joao"},"valor_corrida":10}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::MissingTripId)
        );

        let payload = br#"{"id_corrida":"  ","motorista":{"nome":"Joao"},"valor_corrida":10}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::MissingTripId)
        );
    }

    #[test]
    fn test_missing_driver_name() {
        let payload = br#"{"id_corrida":"c6","motorista":{},"valor_corrida":10}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::MissingDriverName)
        );

        let payload = br#"{"id_corrida":"c6","motorista":{"nome":""},"valor_corrida":10}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::MissingDriverName)
        );
    }

    #[test]
    fn test_bad_fares() {
        let payload = br#"{"id_corrida":"c7","motorista":{"nome":"Joao"}}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::MissingFare)
        );

        let payload = br#"{"id_corrida":"c7","motorista":{"nome":"Joao"},"valor_corrida":"dez"}"#;
        assert!(matches!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::InvalidFare(_))
        ));

        let payload = br#"{"id_corrida":"c7","motorista":{"nome":"Joao"},"valor_corrida":true}"#;
        assert!(matches!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::InvalidFare(_))
        ));

        let payload = br#"{"id_corrida":"c7","motorista":{"nome":"Joao"},"valor_corrida":-5}"#;
        assert_eq!(
            TripCompletedEvent::from_slice(payload),
            Err(MalformedEvent::NegativeFare(dec!(-5)))
        );
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            TripCompletedEvent::from_slice(b"not json"),
            Err(MalformedEvent::InvalidJson(_))
        ));
        assert!(matches!(
            TripCompletedEvent::from_slice(br#"{"motorista":"Joao"}"#),
            Err(MalformedEvent::InvalidJson(_))
        ));
    }
}
