//! The three bus record families and their Avro schemas.
//!
//! Field names follow the downstream consumers' schema registry subjects,
//! so several are PascalCase on the wire. The schemas here are the source
//! of truth: they are registered with the schema registry at first emit and
//! every record is framed against them.

use serde::{Deserialize, Serialize};

pub const TELEMETRY_TOPIC_SUFFIX: &str = "craytelemetry";
pub const EVENTS_TOPIC_SUFFIX: &str = "crayevents";
pub const FABRIC_HEALTH_TOPIC: &str = "crayfabrichealth";

pub const SENSOR_SCHEMA: &str = r#"{
  "type": "record",
  "name": "RedfishCrayOemSensors",
  "fields": [
    {"name": "timestamp", "type": "long"},
    {"name": "Location", "type": "string"},
    {"name": "Index", "type": "int"},
    {"name": "ParentalContext", "type": "string"},
    {"name": "ParentalIndex", "type": "int"},
    {"name": "PhysicalContext", "type": "string"},
    {"name": "PhysicalSubContext", "type": "string"},
    {"name": "DeviceSpecificContext", "type": "string"},
    {"name": "EventName", "type": "string"},
    {"name": "Value", "type": "double"},
    {"name": "SensorName", "type": "string"},
    {"name": "cluster", "type": "string"}
  ]
}"#;

pub const EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "RedfishCrayEvents",
  "fields": [
    {"name": "timestamp", "type": "long"},
    {"name": "Location", "type": "string"},
    {"name": "MessageId", "type": "string"},
    {"name": "Severity", "type": "string"},
    {"name": "Message", "type": "string"},
    {"name": "OriginOfCondition", "type": "string"},
    {"name": "syslog_level", "type": "string"},
    {"name": "cluster", "type": "string"}
  ]
}"#;

pub const FABRIC_HEALTH_SCHEMA: &str = r#"{
  "type": "record",
  "name": "CrayFabricHealth",
  "fields": [
    {"name": "timestamp", "type": "long"},
    {"name": "Location", "type": "string"},
    {"name": "MessageId", "type": "string"},
    {"name": "message", "type": "string"},
    {"name": "Group", "type": "int"},
    {"name": "Switch", "type": "int"},
    {"name": "Port", "type": "int"},
    {"name": "Severity", "type": "string"},
    {"name": "PhysicalContext", "type": "string"},
    {"name": "cluster", "type": "string"}
  ]
}"#;

/// One deduplicated sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Milliseconds since epoch, skew-corrected.
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Index")]
    pub index: i32,
    #[serde(rename = "ParentalContext")]
    pub parental_context: String,
    #[serde(rename = "ParentalIndex")]
    pub parental_index: i32,
    #[serde(rename = "PhysicalContext")]
    pub physical_context: String,
    #[serde(rename = "PhysicalSubContext")]
    pub physical_sub_context: String,
    #[serde(rename = "DeviceSpecificContext")]
    pub device_specific_context: String,
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "SensorName")]
    pub sensor_name: String,
    pub cluster: String,
}

/// One generic (non-telemetry) Redfish event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "OriginOfCondition")]
    pub origin_of_condition: String,
    pub syslog_level: String,
    pub cluster: String,
}

/// One fabric health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    pub message: String,
    #[serde(rename = "Group")]
    pub group: i32,
    #[serde(rename = "Switch")]
    pub switch: i32,
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(rename = "PhysicalContext")]
    pub physical_context: String,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusRecord {
    Telemetry(SensorRecord),
    Event(EventRecord),
    Health(HealthRecord),
}

impl BusRecord {
    /// Destination topic. Metric and event topics carry the configured
    /// prefix; the fabric health topic name is fixed.
    pub fn topic(&self, topic_prefix: &str) -> String {
        match self {
            BusRecord::Telemetry(_) => format!("{topic_prefix}{TELEMETRY_TOPIC_SUFFIX}"),
            BusRecord::Event(_) => format!("{topic_prefix}{EVENTS_TOPIC_SUFFIX}"),
            BusRecord::Health(_) => FABRIC_HEALTH_TOPIC.to_string(),
        }
    }

    /// Registered schema name for this record's family.
    pub fn schema_name(&self) -> &'static str {
        match self {
            BusRecord::Telemetry(_) => "RedfishCrayOemSensors",
            BusRecord::Event(_) => "RedfishCrayEvents",
            BusRecord::Health(_) => "CrayFabricHealth",
        }
    }

    pub fn schema_json(&self) -> &'static str {
        match self {
            BusRecord::Telemetry(_) => SENSOR_SCHEMA,
            BusRecord::Event(_) => EVENT_SCHEMA,
            BusRecord::Health(_) => FABRIC_HEALTH_SCHEMA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::{from_value, to_value, Reader, Schema, Writer};

    fn sensor_record() -> SensorRecord {
        SensorRecord {
            timestamp: 1704067200000,
            location: "x9000c1s0b0".to_string(),
            index: 0,
            parental_context: "Chassis".to_string(),
            parental_index: -1,
            physical_context: "CPU".to_string(),
            physical_sub_context: "".to_string(),
            device_specific_context: "".to_string(),
            event_name: "Temperature".to_string(),
            value: 41.5,
            sensor_name: "Chassis-1CPU0Temperature".to_string(),
            cluster: "foo".to_string(),
        }
    }

    fn event_record() -> EventRecord {
        EventRecord {
            timestamp: 1704067200000,
            location: "x9000c1s0b0".to_string(),
            message_id: "Alert.1.0.PowerSupplyFailed".to_string(),
            severity: "Critical".to_string(),
            message: "PSU 1 failed".to_string(),
            origin_of_condition: "/redfish/v1/Chassis/PSU1".to_string(),
            syslog_level: "error".to_string(),
            cluster: "foo".to_string(),
        }
    }

    fn health_record() -> HealthRecord {
        HealthRecord {
            timestamp: 1704067200000,
            location: "x9000c1r1".to_string(),
            message_id: "CrayFabricHealth.LinkDown".to_string(),
            message: "link down".to_string(),
            group: 1,
            switch: 3,
            port: 12,
            severity: "Warning".to_string(),
            physical_context: "Fabric".to_string(),
            cluster: "foo".to_string(),
        }
    }

    fn round_trip<T>(schema_json: &str, record: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let schema = Schema::parse_str(schema_json).expect("schema must parse");
        let mut writer = Writer::new(&schema, Vec::new());
        writer.append_ser(record).expect("record must serialize");
        let encoded = writer.into_inner().expect("writer must flush");

        let reader = Reader::with_schema(&schema, encoded.as_slice()).expect("reader");
        let value = reader.into_iter().next().expect("one datum").expect("valid datum");
        from_value::<T>(&value).expect("record must deserialize")
    }

    #[test]
    fn test_sensor_schema_round_trip() {
        let record = sensor_record();
        assert_eq!(round_trip(SENSOR_SCHEMA, &record), record);
    }

    #[test]
    fn test_event_schema_round_trip() {
        let record = event_record();
        assert_eq!(round_trip(EVENT_SCHEMA, &record), record);
    }

    #[test]
    fn test_health_schema_round_trip() {
        let record = health_record();
        assert_eq!(round_trip(FABRIC_HEALTH_SCHEMA, &record), record);
    }

    #[test]
    fn test_records_resolve_against_their_schemas() {
        for record in [
            BusRecord::Telemetry(sensor_record()),
            BusRecord::Event(event_record()),
            BusRecord::Health(health_record()),
        ] {
            let schema = Schema::parse_str(record.schema_json()).unwrap();
            let value = match &record {
                BusRecord::Telemetry(r) => to_value(r).unwrap(),
                BusRecord::Event(r) => to_value(r).unwrap(),
                BusRecord::Health(r) => to_value(r).unwrap(),
            };
            assert!(
                value.resolve(&schema).is_ok(),
                "{} does not match its schema",
                record.schema_name()
            );
        }
    }

    #[test]
    fn test_topic_names() {
        let telemetry = BusRecord::Telemetry(sensor_record());
        let event = BusRecord::Event(event_record());
        let health = BusRecord::Health(health_record());

        assert_eq!(telemetry.topic("redfish-"), "redfish-craytelemetry");
        assert_eq!(event.topic(""), "crayevents");
        // Fabric health ignores the prefix.
        assert_eq!(health.topic("redfish-"), "crayfabrichealth");
    }
}
