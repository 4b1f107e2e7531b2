use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::message::MessageUnit;

pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// The event body published by the upstream writers.
///
/// Extra fields are ignored and missing ones read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WeatherEvent {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub country: String,
    #[serde(default, rename = "weather")]
    pub category: String,
}

impl WeatherEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut event: WeatherEvent = serde_json::from_slice(payload)?;
        if event.country.is_empty() {
            event.country = UNKNOWN_COUNTRY.to_owned();
        }
        Ok(event)
    }
}

/// Per-country increments for one batch, plus the batch length.
///
/// `total` counts every unit of the batch, including the ones that failed to
/// decode, so it can be larger than the sum of `counts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountAggregate {
    counts: HashMap<String, i64>,
    total: i64,
}

impl CountAggregate {
    pub fn counts(&self) -> &HashMap<String, i64> {
        &self.counts
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn get(&self, country: &str) -> i64 {
        self.counts.get(country).copied().unwrap_or_default()
    }

    pub fn decoded(&self) -> i64 {
        self.counts.values().sum()
    }
}

/// Folds a batch into a `CountAggregate`, returning it together with the
/// number of payloads that could not be decoded.
pub fn aggregate(batch: &[MessageUnit]) -> (CountAggregate, u64) {
    let mut aggregate = CountAggregate {
        counts: HashMap::new(),
        total: batch.len() as i64,
    };
    let mut decode_errors = 0;

    for unit in batch {
        match WeatherEvent::decode(unit.payload()) {
            Ok(event) => {
                debug!(
                    position = %unit.position(),
                    country = %event.country,
                    description = %event.description,
                    "decoded event"
                );
                *aggregate.counts.entry(event.country).or_default() += 1;
            }
            Err(e) => {
                warn!(position = %unit.position(), "failed to decode event: {}", e);
                decode_errors += 1;
            }
        }
    }

    (aggregate, decode_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(offset: i64, payload: &str) -> MessageUnit {
        MessageUnit::offset("weather-tweets", 0, offset, payload.as_bytes().to_vec())
    }

    #[test]
    fn decode_normalizes_country() {
        let event = WeatherEvent::decode(br#"{"description":"hot","country":"","weather":"Sunny"}"#)
            .unwrap();
        assert_eq!(event.country, UNKNOWN_COUNTRY);
        assert_eq!(event.category, "Sunny");

        let event = WeatherEvent::decode(br#"{"description":"hot"}"#).unwrap();
        assert_eq!(event.country, UNKNOWN_COUNTRY);

        let event =
            WeatherEvent::decode(br#"{"country":"GT","extra":{"nested":true},"weather":"Rainy"}"#)
                .unwrap();
        assert_eq!(event.country, "GT");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WeatherEvent::decode(b"{malformed json}").is_err());
        assert!(WeatherEvent::decode(b"").is_err());
        assert!(WeatherEvent::decode(b"[1, 2]").is_err());
    }

    #[test]
    fn mixed_batch() {
        let batch = vec![
            unit(0, r#"{"country":"FR"}"#),
            unit(1, r#"{"country":""}"#),
            unit(2, "{malformed json}"),
        ];

        let (aggregate, errors) = aggregate(&batch);

        assert_eq!(errors, 1);
        assert_eq!(aggregate.total(), 3);
        assert_eq!(aggregate.counts().len(), 2);
        assert_eq!(aggregate.get("FR"), 1);
        assert_eq!(aggregate.get(UNKNOWN_COUNTRY), 1);
    }

    #[test]
    fn total_counts_every_unit() {
        let batch: Vec<_> = (0..50)
            .map(|i| match i % 3 {
                0 => unit(i, r#"{"country":"GT"}"#),
                1 => unit(i, r#"{"country":"MX"}"#),
                _ => unit(i, "not json"),
            })
            .collect();

        let (aggregate, errors) = aggregate(&batch);

        assert_eq!(aggregate.total(), 50);
        assert_eq!(aggregate.decoded() + errors as i64, 50);
        assert_eq!(aggregate.get("GT"), 17);
        assert_eq!(aggregate.get("MX"), 17);
        assert_eq!(errors, 16);
        assert!(!aggregate.counts().contains_key(""));
    }

    #[test]
    fn empty_batch() {
        let (aggregate, errors) = aggregate(&[]);
        assert_eq!(aggregate, CountAggregate::default());
        assert_eq!(errors, 0);
    }
}
