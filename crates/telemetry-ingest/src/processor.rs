//! Payload decoding and record building.
//!
//! One processor lives inside each worker lane and owns all per-client
//! state: the sampling table and the skew-warning throttle. Dispatch is
//! sticky by client address, so no other lane ever touches this state and
//! none of it is locked.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::alerts::AlertsFile;
use crate::event::{classify, EventEnvelope, EventFamily, IngestPath, OemSensor, RedfishEvent};
use crate::listener::IngestPayload;
use crate::records::{BusRecord, EventRecord, HealthRecord, SensorRecord};
use crate::timeparse::SkewGuard;

/// Sampling-table eviction: entries idle this long are dropped once the
/// table grows past `REAP_TRIGGER_LEN`. Bounds memory for fleets with
/// churning client addresses.
const REAP_TRIGGER_LEN: usize = 4096;
const REAP_MIN_AGE: Duration = Duration::from_secs(60 * 60);

/// Resolves a pusher's address to the name used as the `Location` of its
/// generic events.
pub trait ClientNamer: Send + Sync {
    fn name(&self, client: IpAddr) -> String;
}

/// The two historical sampling modes: rate limiting per metric family per
/// client, or per client regardless of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleScope {
    #[default]
    PerMessageId,
    PerClient,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SampleKey {
    PerMessageId(IpAddr, String),
    PerClient(IpAddr),
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Cluster tag stamped on every record (relay hostname, digits
    /// stripped).
    pub cluster: String,
    /// Minimum spacing between accepted telemetry events per sampling key.
    /// Zero disables sampling.
    pub sample_period: Duration,
    pub sample_scope: SampleScope,
    pub clock_skew_limit: Duration,
}

pub struct Processor {
    config: ProcessorConfig,
    namer: Arc<dyn ClientNamer>,
    alerts: Option<AlertsFile>,
    last_accepted: HashMap<SampleKey, Instant>,
    skew: SkewGuard,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        namer: Arc<dyn ClientNamer>,
        alerts: Option<AlertsFile>,
    ) -> Self {
        let skew = SkewGuard::new(config.clock_skew_limit);
        Self {
            config,
            namer,
            alerts,
            last_accepted: HashMap::new(),
            skew,
        }
    }

    /// Decode one pushed payload into bus records. Malformed payloads and
    /// unknown paths produce no records; the error is logged with the
    /// client address and swallowed.
    pub fn process(&mut self, payload: &IngestPayload) -> Vec<BusRecord> {
        let Some(path) = IngestPath::from_uri(&payload.path) else {
            warn!(client = %payload.client_ip, path = %payload.path,
                "payload on unrecognized path dropped");
            return Vec::new();
        };

        let envelope: EventEnvelope = match serde_json::from_slice(&payload.body) {
            Ok(e) => e,
            Err(e) => {
                error!(client = %payload.client_ip, error = %e, "payload decode failed");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        // Dedup scope is the whole payload: sensors from every telemetry
        // event in this envelope compete for their SensorName slot.
        let mut dedup: HashMap<String, usize> = HashMap::new();
        let mut samples: Vec<SensorRecord> = Vec::new();

        for event in &envelope.events {
            match classify(path, &event.message_id) {
                EventFamily::Telemetry => {
                    self.collect_telemetry(event, payload.client_ip, &mut dedup, &mut samples)
                }
                EventFamily::Generic => {
                    if let Some(record) = self.build_generic(event, payload.client_ip) {
                        records.push(BusRecord::Event(record));
                    }
                }
                EventFamily::FabricHealth => {
                    if let Some(record) = self.build_health(event, payload.client_ip) {
                        records.push(BusRecord::Health(record));
                    }
                }
                EventFamily::Unclassified => {
                    debug!(client = %payload.client_ip, message_id = %event.message_id,
                        "unclassified event dropped");
                }
            }
        }

        records.extend(samples.into_iter().map(BusRecord::Telemetry));
        records
    }

    /// Telemetry events: sample per source, then fold each sensor into the
    /// payload's dedup map, keeping the latest sample per SensorName
    /// (first seen wins ties).
    fn collect_telemetry(
        &mut self,
        event: &RedfishEvent,
        client: IpAddr,
        dedup: &mut HashMap<String, usize>,
        samples: &mut Vec<SensorRecord>,
    ) {
        if !self.accept_sample(client, &event.message_id) {
            debug!(client = %client, message_id = %event.message_id,
                "telemetry event dropped by sampling");
            return;
        }

        for sensor in event.sensors() {
            let Some(record) = self.build_sensor(event, sensor, client) else {
                continue;
            };
            match dedup.get(&record.sensor_name) {
                Some(&idx) => {
                    if record.timestamp > samples[idx].timestamp {
                        samples[idx] = record;
                    }
                }
                None => {
                    dedup.insert(record.sensor_name.clone(), samples.len());
                    samples.push(record);
                }
            }
        }
    }

    fn build_sensor(
        &mut self,
        event: &RedfishEvent,
        sensor: &OemSensor,
        client: IpAddr,
    ) -> Option<SensorRecord> {
        let (Some(location), Some(_), Some(value)) =
            (sensor.location.as_deref(), sensor.timestamp.as_deref(), sensor.value_f64())
        else {
            warn!(client = %client, message_id = %event.message_id,
                "sensor missing Location, Timestamp, or Value; skipped");
            return None;
        };

        let parental_context = sensor.parental_context.clone().unwrap_or_default();
        let parental_index = sensor.parental_index.unwrap_or(-1) as i32;
        let physical_context = sensor.physical_context.clone().unwrap_or_default();
        let index = sensor.index.unwrap_or(-1) as i32;
        let device_specific_context =
            sensor.device_specific_context.clone().unwrap_or_default();
        let physical_sub_context = sensor.physical_sub_context.clone().unwrap_or_default();
        let event_name = event.event_name().to_string();

        let sensor_name = format!(
            "{parental_context}{parental_index}{physical_context}{index}\
             {device_specific_context}{physical_sub_context}{event_name}"
        );
        let timestamp = self.skew.parse_or_now(sensor.timestamp.as_deref(), client);

        Some(SensorRecord {
            timestamp,
            location: location.to_string(),
            index,
            parental_context,
            parental_index,
            physical_context,
            physical_sub_context,
            device_specific_context,
            event_name,
            value,
            sensor_name,
            cluster: self.config.cluster.clone(),
        })
    }

    fn build_generic(&mut self, event: &RedfishEvent, client: IpAddr) -> Option<EventRecord> {
        let Some(raw_timestamp) = event.event_timestamp.as_deref() else {
            warn!(client = %client, message_id = %event.message_id,
                "generic event without EventTimestamp; skipped");
            return None;
        };

        let severity = event.severity.clone().unwrap_or_default();
        let record = EventRecord {
            timestamp: self.skew.parse_or_now(Some(raw_timestamp), client),
            location: self.namer.name(client),
            message_id: event.message_id.clone(),
            syslog_level: syslog_level(&severity).to_string(),
            severity,
            message: event.message.clone().unwrap_or_default(),
            origin_of_condition: event.origin().to_string(),
            cluster: self.config.cluster.clone(),
        };

        if let Some(alerts) = self.alerts.as_mut() {
            if let Err(e) = alerts.record(&record) {
                error!(client = %client, error = %e, "alerts file write failed");
            }
        }
        Some(record)
    }

    fn build_health(&mut self, event: &RedfishEvent, client: IpAddr) -> Option<HealthRecord> {
        let sensors = event.sensors();
        let Some(sensor) = sensors.first() else {
            warn!(client = %client, message_id = %event.message_id,
                "fabric health event without sensors; skipped");
            return None;
        };
        if sensors.len() > 1 {
            // Multi-sensor health events are reserved; only the first is
            // consumed.
            warn!(client = %client, message_id = %event.message_id,
                extra = sensors.len() - 1, "fabric health event with extra sensors");
        }

        let message = match sensor.value.as_ref() {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        Some(HealthRecord {
            timestamp: self.skew.parse_or_now(sensor.timestamp.as_deref(), client),
            location: sensor.location.clone().unwrap_or_default(),
            message_id: event.message_id.clone(),
            message,
            group: sensor.parental_index.unwrap_or(0) as i32,
            switch: sensor.index.unwrap_or(0) as i32,
            port: sensor.sub_index.unwrap_or(0) as i32,
            severity: sensor.physical_sub_context.clone().unwrap_or_default(),
            physical_context: sensor.physical_context.clone().unwrap_or_default(),
            cluster: self.config.cluster.clone(),
        })
    }

    /// Per-source rate limit. Accepts when no prior sample exists or the
    /// spacing since the last accepted sample has reached the period.
    fn accept_sample(&mut self, client: IpAddr, message_id: &str) -> bool {
        if self.config.sample_period.is_zero() {
            return true;
        }
        let key = match self.config.sample_scope {
            SampleScope::PerMessageId => SampleKey::PerMessageId(client, message_id.to_string()),
            SampleScope::PerClient => SampleKey::PerClient(client),
        };
        let now = Instant::now();
        let accept = match self.last_accepted.get(&key) {
            Some(last) => now.duration_since(*last) >= self.config.sample_period,
            None => true,
        };
        if accept {
            self.reap(now);
            self.last_accepted.insert(key, now);
        }
        accept
    }

    fn reap(&mut self, now: Instant) {
        if self.last_accepted.len() < REAP_TRIGGER_LEN {
            return;
        }
        let max_age = REAP_MIN_AGE.max(self.config.sample_period * 10);
        self.last_accepted
            .retain(|_, last| now.duration_since(*last) < max_age);
    }
}

/// Redfish severity to syslog level.
fn syslog_level(severity: &str) -> &'static str {
    match severity {
        "OK" => "information",
        "Warning" => "warning",
        "Critical" => "error",
        _ => "unknown",
    }
}
