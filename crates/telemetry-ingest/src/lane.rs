//! Worker lanes.
//!
//! A lane is one task owning a bounded input queue, a processor (sampling
//! and dedup state), and a bus sink. Payloads from one client always land
//! on the same lane, so nothing here is shared or locked. A sentinel on the
//! input queue (or the queue closing) drains the sink and ends the lane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::alerts::AlertsFile;
use crate::listener::IngestPayload;
use crate::processor::{ClientNamer, Processor, ProcessorConfig};
use crate::producer::{RecordSink, SinkError, SinkFactory};

/// How often an idle lane services bus delivery callbacks.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum LaneInput {
    Payload(IngestPayload),
    /// Drain the sink and stop.
    Shutdown,
}

pub struct WorkerLane {
    index: usize,
    rx: mpsc::Receiver<LaneInput>,
    sink: Box<dyn RecordSink>,
    processor: Processor,
    topic_prefix: String,
}

impl WorkerLane {
    pub async fn run(mut self) {
        debug!(lane = self.index, "worker lane started");
        let mut poll_interval = tokio::time::interval(IDLE_POLL_INTERVAL);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                input = self.rx.recv() => match input {
                    Some(LaneInput::Payload(payload)) => {
                        self.handle(payload).await;
                        self.sink.poll();
                    }
                    Some(LaneInput::Shutdown) | None => break,
                },
                _ = poll_interval.tick() => self.sink.poll(),
            }
        }

        self.sink.flush().await;
        debug!(lane = self.index, "worker lane stopped");
    }

    async fn handle(&mut self, payload: IngestPayload) {
        let records = self.processor.process(&payload);
        for record in records {
            let topic = record.topic(&self.topic_prefix);
            if let Err(e) = self.sink.emit(&topic, &record).await {
                error!(lane = self.index, client = %payload.client_ip, topic = %topic,
                    error = %e, "record emit failed");
            }
        }
    }
}

/// Everything needed to start (and restart) a lane. The supervisor uses
/// this to replace a dead lane with a fresh one at the same index.
pub struct LaneFactory {
    pub processor_config: ProcessorConfig,
    pub topic_prefix: String,
    pub queue_depth: usize,
    pub sink_factory: Arc<dyn SinkFactory>,
    pub namer: Arc<dyn ClientNamer>,
    /// Generic events are mirrored here when set; each lane appends to its
    /// own handle.
    pub alerts_path: Option<PathBuf>,
}

impl LaneFactory {
    pub fn spawn(
        &self,
        index: usize,
    ) -> Result<(mpsc::Sender<LaneInput>, JoinHandle<()>), SinkError> {
        let sink = self.sink_factory.create()?;
        let alerts = match &self.alerts_path {
            Some(path) => match AlertsFile::open(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e,
                        "alerts file unavailable; alert mirroring disabled for this lane");
                    None
                }
            },
            None => None,
        };

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let lane = WorkerLane {
            index,
            rx,
            sink,
            processor: Processor::new(
                self.processor_config.clone(),
                Arc::clone(&self.namer),
                alerts,
            ),
            topic_prefix: self.topic_prefix.clone(),
        };
        let handle = tokio::spawn(lane.run());
        Ok((tx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SampleScope;
    use crate::producer::LogSinkFactory;
    use std::net::IpAddr;

    struct EchoNamer;
    impl ClientNamer for EchoNamer {
        fn name(&self, client: IpAddr) -> String {
            client.to_string()
        }
    }

    fn factory() -> LaneFactory {
        LaneFactory {
            processor_config: ProcessorConfig {
                cluster: "test".to_string(),
                sample_period: Duration::ZERO,
                sample_scope: SampleScope::PerMessageId,
                clock_skew_limit: Duration::from_secs(300),
            },
            topic_prefix: String::new(),
            queue_depth: 8,
            sink_factory: Arc::new(LogSinkFactory),
            namer: Arc::new(EchoNamer),
            alerts_path: None,
        }
    }

    #[tokio::test]
    async fn test_lane_exits_on_sentinel() {
        let (tx, handle) = factory().spawn(0).unwrap();
        tx.send(LaneInput::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("lane must stop on sentinel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lane_exits_on_closed_channel() {
        let (tx, handle) = factory().spawn(1).unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("lane must stop when its queue closes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lane_consumes_payloads() {
        let (tx, handle) = factory().spawn(2).unwrap();
        let payload = IngestPayload {
            path: "/redfish".to_string(),
            client_ip: "10.0.0.1".parse().unwrap(),
            body: serde_json::json!({ "Events": [] }).to_string().into_bytes(),
        };
        tx.send(LaneInput::Payload(payload)).await.unwrap();
        tx.send(LaneInput::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("lane must drain and stop")
            .unwrap();
    }
}
