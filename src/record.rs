//! Published output records.
//!
//! Each derived value is held in a [`Record<T>`], a time-stamped observable
//! built on `tokio::sync::watch`. The recompute steps are the only writers;
//! any number of readers (the serving layer, logging, tests) can subscribe.
//!
//! # Example
//!
//! ```rust,ignore
//! let energy = Record::new("SP1K1:MONO:CALC:ENERGY", 0.0)
//!     .with_description("Calculated SP1K1 Mono energy in eV")
//!     .with_units("eV")
//!     .with_precision(3);
//!
//! let mut rx = energy.subscribe();
//! energy.publish(712.5, timestamp);
//! rx.changed().await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::watch;

/// EPICS-style record type of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Analog input
    Ai,
    /// String input
    Stringin,
}

impl RecordType {
    /// EPICS record type name.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Ai => "ai",
            RecordType::Stringin => "stringin",
        }
    }
}

/// Static description of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Full PV name, including the server prefix
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Engineering units
    pub units: Option<String>,
    /// Display precision for numeric records
    pub precision: Option<u16>,
    /// Record type
    pub record_type: RecordType,
    /// External readers may not write to this record
    pub read_only: bool,
}

/// A value together with the timestamp it was published with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    /// Current value
    pub value: T,
    /// Timestamp of the last write
    pub timestamp: DateTime<Utc>,
}

/// Serializable view of a record, used for listings and JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Record metadata
    #[serde(flatten)]
    pub metadata: RecordMetadata,
    /// Current value
    pub value: serde_json::Value,
    /// Timestamp of the last write
    pub timestamp: DateTime<Utc>,
}

/// Type-erased access to a record.
pub trait RecordBase: Send + Sync {
    /// Full PV name
    fn name(&self) -> &str;

    /// Record metadata
    fn metadata(&self) -> &RecordMetadata;

    /// Current value and timestamp in serializable form
    fn snapshot(&self) -> RecordSnapshot;

    /// Number of live subscribers
    fn subscriber_count(&self) -> usize;
}

/// A read-only, time-stamped, observable output value.
pub struct Record<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<Stamped<T>>,
    metadata: RecordMetadata,
}

impl<T: Clone + Send + Sync + 'static> Debug for Record<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl<T> Record<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an analog record holding `initial`.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(Stamped {
            value: initial,
            timestamp: Utc::now(),
        });
        Self {
            sender,
            metadata: RecordMetadata {
                name: name.into(),
                description: None,
                units: None,
                precision: None,
                record_type: RecordType::Ai,
                read_only: true,
            },
        }
    }

    /// Add a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Add engineering units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Set the display precision.
    pub fn with_precision(mut self, precision: u16) -> Self {
        self.metadata.precision = Some(precision);
        self
    }

    /// Set the record type.
    pub fn with_record_type(mut self, record_type: RecordType) -> Self {
        self.metadata.record_type = record_type;
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().value.clone()
    }

    /// Timestamp of the last write.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.sender.borrow().timestamp
    }

    /// Current value and timestamp.
    pub fn stamped(&self) -> Stamped<T> {
        self.sender.borrow().clone()
    }

    /// Full PV name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Record metadata.
    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    /// Write a new value with the given timestamp, notifying all subscribers.
    ///
    /// Every write notifies, even when the value is unchanged: the timestamp
    /// still moves.
    pub fn publish(&self, value: T, timestamp: DateTime<Utc>) {
        self.sender.send_replace(Stamped { value, timestamp });
    }

    /// Subscribe to writes.
    pub fn subscribe(&self) -> watch::Receiver<Stamped<T>> {
        self.sender.subscribe()
    }
}

impl<T> RecordBase for Record<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    fn snapshot(&self) -> RecordSnapshot {
        let stamped = self.stamped();
        RecordSnapshot {
            metadata: self.metadata.clone(),
            value: serde_json::to_value(&stamped.value).unwrap_or(serde_json::Value::Null),
            timestamp: stamped.timestamp,
        }
    }

    fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// =============================================================================
// OutputRecords - the IOC's record database
// =============================================================================

/// Record name suffixes, appended to the server prefix.
pub mod suffix {
    /// Photon energy
    pub const ENERGY: &str = "ENERGY";
    /// Fixed-focus constant
    pub const CFF: &str = "CFF";
    /// Monochromatic bandwidth
    pub const BANDWIDTH: &str = "BANDWIDTH";
    /// Active grating
    pub const GRATING: &str = "GRATING";
}

/// The four records served by the IOC.
#[derive(Debug)]
pub struct OutputRecords {
    /// Calculated energy in eV
    pub energy: Record<f64>,
    /// Cff number
    pub cff: Record<f64>,
    /// Bandwidth in eV
    pub bandwidth: Record<f64>,
    /// Grating in use
    pub grating: Record<String>,
}

impl OutputRecords {
    /// Build the records under `prefix`, all holding their defaults.
    pub fn new(prefix: &str) -> Self {
        Self {
            energy: Record::new(format!("{prefix}{}", suffix::ENERGY), 0.0)
                .with_description("Calculated SP1K1 Mono energy in eV")
                .with_units("eV")
                .with_precision(3),
            cff: Record::new(format!("{prefix}{}", suffix::CFF), 0.0)
                .with_description("Cff number")
                .with_precision(3),
            bandwidth: Record::new(format!("{prefix}{}", suffix::BANDWIDTH), 0.0)
                .with_description("SP1K1 bandwidth in eV")
                .with_units("eV")
                .with_precision(3),
            grating: Record::new(format!("{prefix}{}", suffix::GRATING), String::new())
                .with_description("Which grating is in use")
                .with_record_type(RecordType::Stringin),
        }
    }

    /// All records as trait objects, in declaration order.
    pub fn all(&self) -> [&dyn RecordBase; 4] {
        [&self.energy, &self.cff, &self.bandwidth, &self.grating]
    }

    /// Look up a record by full PV name.
    pub fn get(&self, name: &str) -> Option<&dyn RecordBase> {
        self.all().into_iter().find(|r| r.name() == name)
    }

    /// Snapshot every record.
    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        self.all().iter().map(|r| r.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_basic() {
        let record = Record::new("TST:VALUE", 42.0);
        assert_eq!(record.get(), 42.0);
        assert_eq!(record.name(), "TST:VALUE");
        assert!(record.metadata().read_only);

        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        record.publish(7.5, ts);
        assert_eq!(record.get(), 7.5);
        assert_eq!(record.timestamp(), ts);
    }

    #[tokio::test]
    async fn test_record_subscription_sees_repeated_value() {
        let record = Record::new("TST:VALUE", 0.0);
        let mut rx = record.subscribe();

        let ts = Utc::now();
        record.publish(0.0, ts);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().timestamp, ts);
    }

    #[test]
    fn test_output_records_metadata() {
        let records = OutputRecords::new("SP1K1:MONO:CALC:");
        assert_eq!(records.energy.name(), "SP1K1:MONO:CALC:ENERGY");
        assert_eq!(records.energy.metadata().units.as_deref(), Some("eV"));
        assert_eq!(records.energy.metadata().precision, Some(3));
        assert_eq!(records.cff.metadata().units, None);
        assert_eq!(records.bandwidth.metadata().units.as_deref(), Some("eV"));
        assert_eq!(
            records.grating.metadata().record_type,
            RecordType::Stringin
        );
        assert_eq!(records.grating.get(), "");
    }

    #[test]
    fn test_lookup_and_snapshot() {
        let records = OutputRecords::new("TST:");
        records.grating.publish("LEG".to_string(), Utc::now());

        let grating = records.get("TST:GRATING").unwrap();
        assert_eq!(grating.snapshot().value, serde_json::json!("LEG"));
        assert!(records.get("TST:MISSING").is_none());

        let names: Vec<String> = records
            .snapshot()
            .into_iter()
            .map(|s| s.metadata.name)
            .collect();
        assert_eq!(names, ["TST:ENERGY", "TST:CFF", "TST:BANDWIDTH", "TST:GRATING"]);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let records = OutputRecords::new("TST:");
        let json = serde_json::to_value(records.cff.snapshot()).unwrap();
        assert_eq!(json["name"], "TST:CFF");
        assert_eq!(json["record_type"], "ai");
        assert_eq!(json["value"], serde_json::json!(0.0));
    }
}
