//! Bus publication.
//!
//! Each worker lane owns one sink, created from its factory at lane start
//! (and again after a supervised restart). The Kafka sink frames records
//! against their registered Avro schemas and hands them to librdkafka's
//! outbound queue; delivery results surface asynchronously through the
//! producer context and are only logged, since the bus owns durability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use schema_registry_converter::async_impl::avro::AvroEncoder;
use schema_registry_converter::async_impl::schema_registry::SrSettings;
use schema_registry_converter::schema_registry_common::{
    SchemaType, SubjectNameStrategy, SuppliedSchema,
};
use tracing::{error, info, trace};

use crate::records::{BusRecord, EVENT_SCHEMA, FABRIC_HEALTH_SCHEMA, SENSOR_SCHEMA};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("bus producer configuration invalid: {0}")]
    Config(String),

    #[error("record rejected by schema framing: {0}")]
    Schema(String),

    #[error("record could not be queued: {0}")]
    Queue(String),
}

/// Destination for finished records. `emit` must not block on the bus;
/// `poll` services delivery callbacks and is called once per lane
/// iteration; `flush` drains pending submissions at shutdown.
#[async_trait]
pub trait RecordSink: Send {
    async fn emit(&self, topic: &str, record: &BusRecord) -> Result<(), SinkError>;
    fn poll(&self);
    async fn flush(&self);
}

/// Builds one sink per lane. Lanes are restarted by the supervisor, so sink
/// construction has to be repeatable.
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RecordSink>, SinkError>;
}

/// Logs delivery outcomes from librdkafka's callback thread.
struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: ()) {
        match result {
            Ok(message) => trace!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "record delivered"
            ),
            Err((e, message)) => error!(
                topic = message.topic(),
                error = %e,
                "record delivery failed"
            ),
        }
    }
}

pub struct KafkaSinkFactory {
    kafka_config: HashMap<String, String>,
    registry_url: String,
}

impl KafkaSinkFactory {
    /// Validates the embedded schemas and the bus configuration once, up
    /// front, so a bad deployment fails at startup instead of on the first
    /// record.
    pub fn new(
        kafka_config: HashMap<String, String>,
        registry_url: String,
    ) -> Result<Self, SinkError> {
        for schema in [SENSOR_SCHEMA, EVENT_SCHEMA, FABRIC_HEALTH_SCHEMA] {
            apache_avro::Schema::parse_str(schema)
                .map_err(|e| SinkError::Schema(e.to_string()))?;
        }
        if !kafka_config.contains_key("bootstrap.servers") {
            return Err(SinkError::Config(
                "kafka section is missing bootstrap.servers".to_string(),
            ));
        }
        if registry_url.is_empty() {
            return Err(SinkError::Config(
                "schema_registry section is missing url".to_string(),
            ));
        }
        Ok(Self {
            kafka_config,
            registry_url,
        })
    }
}

impl SinkFactory for KafkaSinkFactory {
    fn create(&self) -> Result<Box<dyn RecordSink>, SinkError> {
        let mut config = ClientConfig::new();
        for (key, value) in &self.kafka_config {
            config.set(key, value);
        }
        let producer: BaseProducer<DeliveryLogger> = config
            .create_with_context(DeliveryLogger)
            .map_err(|e| SinkError::Config(e.to_string()))?;

        let encoder = AvroEncoder::new(SrSettings::new(self.registry_url.clone()));
        Ok(Box::new(KafkaSink { producer, encoder }))
    }
}

pub struct KafkaSink {
    producer: BaseProducer<DeliveryLogger>,
    encoder: AvroEncoder<'static>,
}

impl KafkaSink {
    fn strategy(topic: &str, record: &BusRecord) -> SubjectNameStrategy {
        SubjectNameStrategy::TopicNameStrategyWithSchema(
            topic.to_string(),
            false,
            SuppliedSchema {
                name: Some(record.schema_name().to_string()),
                schema_type: SchemaType::Avro,
                schema: record.schema_json().to_string(),
                references: Vec::new(),
            },
        )
    }
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn emit(&self, topic: &str, record: &BusRecord) -> Result<(), SinkError> {
        let strategy = Self::strategy(topic, record);
        let payload = match record {
            BusRecord::Telemetry(r) => self.encoder.encode_struct(r, &strategy).await,
            BusRecord::Event(r) => self.encoder.encode_struct(r, &strategy).await,
            BusRecord::Health(r) => self.encoder.encode_struct(r, &strategy).await,
        }
        .map_err(|e| SinkError::Schema(e.to_string()))?;

        self.producer
            .send(BaseRecord::<(), Vec<u8>>::to(topic).payload(&payload))
            .map_err(|(e, _)| SinkError::Queue(e.to_string()))
    }

    fn poll(&self) {
        self.producer.poll(Duration::ZERO);
    }

    async fn flush(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            error!(error = %e, "bus producer flush failed");
        }
    }
}

/// Dry-run sink: records are logged instead of produced. Keeps the whole
/// pipeline exercisable on hosts with no bus reachable.
pub struct LogSinkFactory;

impl SinkFactory for LogSinkFactory {
    fn create(&self) -> Result<Box<dyn RecordSink>, SinkError> {
        Ok(Box::new(LogSink))
    }
}

struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn emit(&self, topic: &str, record: &BusRecord) -> Result<(), SinkError> {
        let rendered = match record {
            BusRecord::Telemetry(r) => serde_json::to_string(r),
            BusRecord::Event(r) => serde_json::to_string(r),
            BusRecord::Health(r) => serde_json::to_string(r),
        }
        .unwrap_or_else(|e| format!("<unrenderable: {e}>"));
        info!(topic, record = %rendered, "record (bus disabled)");
        Ok(())
    }

    fn poll(&self) {}

    async fn flush(&self) {}
}
