//! Wire shapes of pushed Redfish event envelopes, and classification into
//! the three record families.
//!
//! The envelope is loosely typed on the wire; everything beyond `Events` and
//! `MessageId` is optional and defaulted downstream. Classification is by
//! `MessageId` prefix, scoped by the ingest path the pusher used.

use serde::Deserialize;

pub const TELEMETRY_PREFIX: &str = "CrayTelemetry.";
pub const FABRIC_HEALTH_PREFIX: &str = "CrayFabricHealth";

/// The two push paths this relay subscribes endpoints to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPath {
    Redfish,
    Slingshot,
}

impl IngestPath {
    pub fn from_uri(path: &str) -> Option<Self> {
        match path {
            "/redfish" => Some(IngestPath::Redfish),
            "/slingshot" => Some(IngestPath::Slingshot),
            _ => None,
        }
    }
}

/// Which processing pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Telemetry,
    Generic,
    FabricHealth,
    /// Recognized path, unrecognized message family; dropped with a debug
    /// log.
    Unclassified,
}

pub fn classify(path: IngestPath, message_id: &str) -> EventFamily {
    match path {
        IngestPath::Redfish => {
            if message_id.starts_with(TELEMETRY_PREFIX) {
                EventFamily::Telemetry
            } else {
                EventFamily::Generic
            }
        }
        IngestPath::Slingshot => {
            if message_id.starts_with(FABRIC_HEALTH_PREFIX) {
                EventFamily::FabricHealth
            } else {
                EventFamily::Unclassified
            }
        }
    }
}

/// An envelope without an `Events` array is malformed and fails decode.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "Events")]
    pub events: Vec<RedfishEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RedfishEvent {
    #[serde(rename = "MessageId", default)]
    pub message_id: String,
    #[serde(rename = "EventTimestamp")]
    pub event_timestamp: Option<String>,
    #[serde(rename = "Severity")]
    pub severity: Option<String>,
    #[serde(rename = "Message")]
    pub message: Option<String>,
    #[serde(rename = "OriginOfCondition")]
    pub origin_of_condition: Option<OriginOfCondition>,
    #[serde(rename = "Oem")]
    pub oem: Option<Oem>,
}

impl RedfishEvent {
    /// Event name: the message id with its family prefix stripped.
    pub fn event_name(&self) -> &str {
        self.message_id
            .strip_prefix(TELEMETRY_PREFIX)
            .unwrap_or(&self.message_id)
    }

    /// Flattened `OriginOfCondition.@odata.id`, or empty.
    pub fn origin(&self) -> &str {
        self.origin_of_condition
            .as_ref()
            .and_then(|o| o.odata_id.as_deref())
            .unwrap_or("")
    }

    pub fn sensors(&self) -> &[OemSensor] {
        self.oem.as_ref().map(|o| o.sensors.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OriginOfCondition {
    #[serde(rename = "@odata.id")]
    pub odata_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Oem {
    #[serde(rename = "Sensors", default)]
    pub sensors: Vec<OemSensor>,
}

/// One sample inside `Oem.Sensors`. `Location`, `Timestamp`, and `Value`
/// are required for telemetry; the geometric descriptors are optional and
/// defaulted (`""` / `-1`).
#[derive(Debug, Default, Deserialize)]
pub struct OemSensor {
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "ParentalContext")]
    pub parental_context: Option<String>,
    #[serde(rename = "ParentalIndex")]
    pub parental_index: Option<i64>,
    #[serde(rename = "PhysicalContext")]
    pub physical_context: Option<String>,
    #[serde(rename = "Index")]
    pub index: Option<i64>,
    #[serde(rename = "DeviceSpecificContext")]
    pub device_specific_context: Option<String>,
    #[serde(rename = "PhysicalSubContext")]
    pub physical_sub_context: Option<String>,
    #[serde(rename = "SubIndex")]
    pub sub_index: Option<i64>,
}

impl OemSensor {
    /// Sensor values arrive as numbers or numeric strings.
    pub fn value_f64(&self) -> Option<f64> {
        match self.value.as_ref()? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_redfish() {
        assert_eq!(
            classify(IngestPath::Redfish, "CrayTelemetry.Temperature"),
            EventFamily::Telemetry
        );
        assert_eq!(
            classify(IngestPath::Redfish, "Alert.1.0.PowerSupplyFailed"),
            EventFamily::Generic
        );
    }

    #[test]
    fn test_classify_slingshot() {
        assert_eq!(
            classify(IngestPath::Slingshot, "CrayFabricHealth.LinkDown"),
            EventFamily::FabricHealth
        );
        assert_eq!(
            classify(IngestPath::Slingshot, "CrayTelemetry.Temperature"),
            EventFamily::Unclassified
        );
    }

    #[test]
    fn test_path_from_uri() {
        assert_eq!(IngestPath::from_uri("/redfish"), Some(IngestPath::Redfish));
        assert_eq!(IngestPath::from_uri("/slingshot"), Some(IngestPath::Slingshot));
        assert_eq!(IngestPath::from_uri("/other"), None);
    }

    #[test]
    fn test_envelope_decode() {
        let raw = serde_json::json!({
            "Events": [{
                "MessageId": "CrayTelemetry.Temperature",
                "EventTimestamp": "2024-01-01T00:00:00Z",
                "Oem": { "Sensors": [{
                    "Location": "x9000c1s0b0",
                    "Timestamp": "2024-01-01T00:00:00Z",
                    "Value": 41.5,
                    "PhysicalContext": "CPU",
                    "Index": 0
                }]}
            }]
        });
        let envelope: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.events.len(), 1);
        let event = &envelope.events[0];
        assert_eq!(event.event_name(), "Temperature");
        assert_eq!(event.sensors().len(), 1);
        assert_eq!(event.sensors()[0].value_f64(), Some(41.5));
        assert_eq!(event.sensors()[0].index, Some(0));
        assert!(event.sensors()[0].parental_index.is_none());
    }

    #[test]
    fn test_sensor_value_from_string() {
        let sensor = OemSensor {
            value: Some(serde_json::Value::String(" 12.25 ".to_string())),
            ..Default::default()
        };
        assert_eq!(sensor.value_f64(), Some(12.25));
    }

    #[test]
    fn test_origin_flattening() {
        let event = RedfishEvent {
            origin_of_condition: Some(OriginOfCondition {
                odata_id: Some("/x".to_string()),
            }),
            ..Default::default()
        };
        assert_eq!(event.origin(), "/x");
        assert_eq!(RedfishEvent::default().origin(), "");
    }

    #[test]
    fn test_envelope_without_events_is_malformed() {
        assert!(serde_json::from_str::<EventEnvelope>("{}").is_err());
        let empty: EventEnvelope = serde_json::from_str(r#"{"Events":[]}"#).unwrap();
        assert!(empty.events.is_empty());
    }
}
