//! Ingest pipeline for Redfish event pushes.
//!
//! Managed endpoints push JSON event envelopes at this relay's HTTP
//! listener. The listener acknowledges immediately and hands each payload to
//! one of N worker lanes, sticky by client address so per-client state never
//! crosses a lane boundary. Lanes decode the envelope, classify each event
//! by message-id family, apply per-source sampling and per-metric
//! last-value-wins dedup, and publish Avro-encoded records to the bus.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod alerts;
pub mod event;
pub mod lane;
pub mod listener;
pub mod processor;
pub mod producer;
pub mod records;
pub mod timeparse;

pub use lane::{LaneFactory, LaneInput, WorkerLane};
pub use listener::{Dispatcher, IngestListener, IngestPayload, LaneFailure, LaneUpdate};
pub use processor::{ClientNamer, Processor, ProcessorConfig, SampleScope};
pub use producer::{KafkaSinkFactory, LogSinkFactory, RecordSink, SinkError, SinkFactory};
pub use records::BusRecord;
