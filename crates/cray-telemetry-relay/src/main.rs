//! Redfish telemetry and event relay daemon.
//!
//! Wires the two halves together: the subscription reconciler keeps every
//! managed endpoint pushing at this relay, and the ingest pipeline turns
//! those pushes into bus records. Signals drive reload, purge, and
//! shutdown.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod control;
mod host;
mod hostlist;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use redfish_subscriber::client::RedfishSessionFactory;
use redfish_subscriber::reconciler::{ReconcileCommand, Reconciler};
use redfish_subscriber::resolver::HostResolver;
use telemetry_ingest::lane::LaneFactory;
use telemetry_ingest::listener::{Dispatcher, IngestListener, LaneUpdate};
use telemetry_ingest::processor::{ClientNamer, ProcessorConfig};
use telemetry_ingest::producer::{KafkaSinkFactory, LogSinkFactory, SinkFactory};

use config::{ConfigError, RelayConfig};
use control::ControlEvent;

const DEFAULT_CONFIG_PATH: &str = "/etc/cray-telemetry-relay/config.yaml";
const MAX_CONTENT_LENGTH: usize = 10_000_000;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// `Location` for generic events: the pusher's address resolved through
/// the cached resolver, preferring xnames.
struct ResolverNamer {
    resolver: Arc<HostResolver>,
}

impl ClientNamer for ResolverNamer {
    fn name(&self, client: IpAddr) -> String {
        self.resolver.resolve_addr(client)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
    );

    // Configuration problems are the only fatal errors; everything after
    // startup is logged and survived.
    let config = match RelayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.general.log_level);
    info!(config = %config_path.display(), "starting telemetry relay");

    match run(config, &config_path).await {
        Ok(()) => {
            info!("relay shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,librdkafka=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_level(true)
        .with_target(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging subsystem already initialized");
    }
}

async fn run(config: RelayConfig, config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let local_names = host::local_names();
    let cluster = host::cluster_name(&local_names[0]);
    let resolver = Arc::new(HostResolver::new());

    // Subscription reconciler.
    let fleet = Arc::new(config.fleet_spec(&local_names)?);
    info!(
        endpoints = fleet.endpoints.len(),
        refresh_secs = fleet.refresh_interval.as_secs(),
        "reconciler configured"
    );
    let session_factory = Arc::new(RedfishSessionFactory::new(
        config.subscription_timeout(),
        config.general.subscription_retries,
    ));
    let (reconcile_tx, reconcile_rx) = mpsc::channel(1);
    let reconciler_task = tokio::spawn(Reconciler::new(session_factory).run(fleet, reconcile_rx));

    // Ingest pipeline.
    let sink_factory: Arc<dyn SinkFactory> = if config.general.no_kafka {
        info!("bus disabled (no_kafka); records will be logged");
        Arc::new(LogSinkFactory)
    } else {
        Arc::new(KafkaSinkFactory::new(
            config.kafka.clone(),
            config.schema_registry.url.clone(),
        )?)
    };

    let lane_factory = LaneFactory {
        processor_config: ProcessorConfig {
            cluster,
            sample_period: config.sample_period(),
            sample_scope: config.general.sample_scope,
            clock_skew_limit: config.clock_skew_limit(),
        },
        topic_prefix: config.general.topic_prefix.clone(),
        queue_depth: 1024,
        sink_factory,
        namer: Arc::new(ResolverNamer {
            resolver: Arc::clone(&resolver),
        }),
        alerts_path: config
            .general
            .log_alerts
            .then(|| PathBuf::from(&config.general.log_alerts_file)),
    };

    let mut lane_txs = Vec::with_capacity(config.general.worker_count);
    let mut lane_handles = Vec::with_capacity(config.general.worker_count);
    for index in 0..config.general.worker_count {
        let (tx, handle) = lane_factory.spawn(index)?;
        lane_txs.push(tx);
        lane_handles.push(handle);
    }
    info!(lanes = lane_txs.len(), "worker lanes started");

    let (supervisor_tx, supervisor_rx) = mpsc::channel(config.general.worker_count.max(1));
    let (dispatcher, payload_tx, update_tx) = Dispatcher::new(lane_txs, supervisor_tx);
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let cancel = CancellationToken::new();
    let listen_addr = resolve_listen_addr(&config.general.address, config.general.port)?;
    let listener = IngestListener::bind(
        listen_addr,
        payload_tx,
        cancel.clone(),
        MAX_CONTENT_LENGTH,
    )
    .await?;
    info!(addr = %listen_addr, "ingest listener bound");
    let listener_task = tokio::spawn(listener.run());

    let supervisor = control::LaneSupervisor::new(
        lane_factory,
        update_tx.clone(),
        supervisor_rx,
        lane_handles,
    );
    let supervisor_task = tokio::spawn(supervisor.run(cancel.clone()));

    // Control loop.
    let mut control_rx = control::spawn_signal_listener()?;
    loop {
        let Some(event) = control_rx.recv().await else {
            break;
        };
        match event {
            ControlEvent::Reload => {
                reload(config_path, &local_names, &reconcile_tx);
            }
            ControlEvent::Purge => {
                info!("purging subscriptions before exit");
                let (ack_tx, ack_rx) = oneshot::channel();
                if reconcile_tx
                    .send(ReconcileCommand::Purge(ack_tx))
                    .await
                    .is_ok()
                {
                    let _ = ack_rx.await;
                }
                break;
            }
            ControlEvent::Shutdown => {
                let _ = reconcile_tx.send(ReconcileCommand::Shutdown).await;
                break;
            }
        }
    }

    // Graceful shutdown: sentinel every lane via the dispatcher, stop the
    // listener, join everything.
    info!("shutting down");
    let _ = update_tx.send(LaneUpdate::Shutdown).await;
    cancel.cancel();

    for (name, task) in [
        ("supervisor", supervisor_task),
        ("dispatcher", dispatcher_task),
        ("reconciler", reconciler_task),
    ] {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!(task = name, "task did not stop within the shutdown timeout");
        }
    }
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, listener_task).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "listener exited with error"),
        Ok(_) => {}
        Err(_) => warn!("listener did not stop within the shutdown timeout"),
    }
    Ok(())
}

/// Reload configuration and push the new fleet spec to the reconciler.
/// A bad config at reload time is logged and ignored; the running spec
/// stays in force.
fn reload(
    config_path: &Path,
    local_names: &[String],
    reconcile_tx: &mpsc::Sender<ReconcileCommand>,
) {
    info!(config = %config_path.display(), "reloading configuration");
    let fleet = match RelayConfig::load(config_path)
        .and_then(|config| config.fleet_spec(local_names))
    {
        Ok(fleet) => Arc::new(fleet),
        Err(e) => {
            error!(error = %e, "reload failed; keeping current subscriptions");
            return;
        }
    };
    debug!(endpoints = fleet.endpoints.len(), "new fleet spec loaded");
    if reconcile_tx
        .try_send(ReconcileCommand::Reconcile(fleet))
        .is_err()
    {
        warn!("reconciler busy; reload-triggered reconcile dropped");
    }
}

fn resolve_listen_addr(address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{address}:{port}")
        .to_socket_addrs()
        .map_err(|e| ConfigError::Invalid(format!("cannot resolve listen address: {e}")))?
        .next()
        .ok_or_else(|| {
            ConfigError::Invalid(format!("listen address '{address}' resolves to nothing"))
        })
}
