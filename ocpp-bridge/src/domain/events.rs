//! Normalized events published to the backend
//!
//! Wire format (one JSON object per event channel entry):
//!
//! ```json
//! {"event": "start_transaction", "domain": "cs.example.com",
//!  "data": {"charger": "CP1", "conn": 1, "tag": "RFID-1", "meter_start": 0}}
//! ```
//!
//! The kind tag is derived from the payload variant, so an [`Event`] can never carry a
//! payload of another kind. New kinds are added as new variants; existing encodings
//! do not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChangeConnectorStatus,
    StartTransaction,
    StopTransaction,
    #[serde(rename = "meter_value")]
    MeterValues,
    Health,
    DataTransfer,
    ConnectCharger,
    DisconnectCharger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStatusChanged {
    pub charger: String,
    pub conn: i32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStarted {
    pub charger: String,
    pub conn: i32,
    pub tag: String,
    pub meter_start: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStopped {
    pub charger: String,
    pub transaction_id: i32,
    pub reason: String,
    pub meter_stop: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesReported {
    pub charger: String,
    pub conn: i32,
    #[serde(default)]
    pub transaction_id: Option<i32>,
    /// Sampled values exactly as the charge point sent them
    pub meter_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub charger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferReceived {
    pub charger: String,
    pub vendor_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Vendor blob exactly as the charge point sent it
    #[serde(default)]
    pub data: Value,
}

/// Charger connect/disconnect notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerPresence {
    pub charger: String,
}

/// Event payload, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ConnectorStatusChanged(ConnectorStatusChanged),
    TransactionStarted(TransactionStarted),
    TransactionStopped(TransactionStopped),
    MeterValues(MeterValuesReported),
    Health(HealthCheck),
    DataTransfer(DataTransferReceived),
    Connected(ChargerPresence),
    Disconnected(ChargerPresence),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ConnectorStatusChanged(_) => EventKind::ChangeConnectorStatus,
            EventPayload::TransactionStarted(_) => EventKind::StartTransaction,
            EventPayload::TransactionStopped(_) => EventKind::StopTransaction,
            EventPayload::MeterValues(_) => EventKind::MeterValues,
            EventPayload::Health(_) => EventKind::Health,
            EventPayload::DataTransfer(_) => EventKind::DataTransfer,
            EventPayload::Connected(_) => EventKind::ConnectCharger,
            EventPayload::Disconnected(_) => EventKind::DisconnectCharger,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventPayload::ConnectorStatusChanged(p) => serde_json::to_value(p),
            EventPayload::TransactionStarted(p) => serde_json::to_value(p),
            EventPayload::TransactionStopped(p) => serde_json::to_value(p),
            EventPayload::MeterValues(p) => serde_json::to_value(p),
            EventPayload::Health(p) => serde_json::to_value(p),
            EventPayload::DataTransfer(p) => serde_json::to_value(p),
            EventPayload::Connected(p) | EventPayload::Disconnected(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: EventKind, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::ChangeConnectorStatus => Self::ConnectorStatusChanged(serde_json::from_value(data)?),
            EventKind::StartTransaction => Self::TransactionStarted(serde_json::from_value(data)?),
            EventKind::StopTransaction => Self::TransactionStopped(serde_json::from_value(data)?),
            EventKind::MeterValues => Self::MeterValues(serde_json::from_value(data)?),
            EventKind::Health => Self::Health(serde_json::from_value(data)?),
            EventKind::DataTransfer => Self::DataTransfer(serde_json::from_value(data)?),
            EventKind::ConnectCharger => Self::Connected(serde_json::from_value(data)?),
            EventKind::DisconnectCharger => Self::Disconnected(serde_json::from_value(data)?),
        })
    }
}

/// A normalized event; immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    domain: String,
    payload: EventPayload,
}

impl Event {
    pub fn new(domain: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            domain: domain.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Host the charge point connected through
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Encode to the event channel wire format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the event channel wire format
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Wire shape shared by serialization and deserialization
#[derive(Serialize, Deserialize)]
struct WireEvent {
    event: EventKind,
    #[serde(default)]
    domain: String,
    data: Value,
}

impl Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = WireEvent {
            event: self.kind(),
            domain: self.domain.clone(),
            data: self.payload.to_value().map_err(serde::ser::Error::custom)?,
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEvent::deserialize(deserializer)?;
        let payload = EventPayload::from_value(wire.event, wire.data).map_err(serde::de::Error::custom)?;
        Ok(Event::new(wire.domain, payload))
    }
}
