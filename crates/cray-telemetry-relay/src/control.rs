//! Control plane: signals and lane supervision.
//!
//! Signals are converted to values on a capacity-one channel, so control is
//! edge triggered: a signal arriving while a previous one is still pending
//! is dropped rather than queued.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telemetry_ingest::lane::LaneFactory;
use telemetry_ingest::listener::{LaneFailure, LaneUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Reload configuration, then reconcile out of cycle (HUP, USR1).
    Reload,
    /// Run one purge cycle and exit (USR2).
    Purge,
    /// Graceful shutdown (TERM, INT).
    Shutdown,
}

/// Register the daemon's signals and convert them to control events.
pub fn spawn_signal_listener() -> std::io::Result<mpsc::Receiver<ControlEvent>> {
    let (tx, rx) = mpsc::channel(1);

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP");
                    ControlEvent::Reload
                }
                _ = sigusr1.recv() => {
                    info!("received SIGUSR1");
                    ControlEvent::Reload
                }
                _ = sigusr2.recv() => {
                    info!("received SIGUSR2");
                    ControlEvent::Purge
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    ControlEvent::Shutdown
                }
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    ControlEvent::Shutdown
                }
            };
            // Edge triggered: drop the signal if one is already pending.
            if tx.try_send(event).is_err() {
                warn!(?event, "control event dropped; another is pending");
            }
        }
    });

    Ok(rx)
}

/// Restarts dead lanes reported by the dispatcher and joins every lane at
/// shutdown. A replacement lane keeps its index, so clients already
/// assigned there resume on the new worker.
pub struct LaneSupervisor {
    factory: LaneFactory,
    update_tx: mpsc::Sender<LaneUpdate>,
    failure_rx: mpsc::Receiver<LaneFailure>,
    handles: Vec<JoinHandle<()>>,
}

impl LaneSupervisor {
    pub fn new(
        factory: LaneFactory,
        update_tx: mpsc::Sender<LaneUpdate>,
        failure_rx: mpsc::Receiver<LaneFailure>,
        handles: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            factory,
            update_tx,
            failure_rx,
            handles,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                failure = self.failure_rx.recv() => match failure {
                    Some(LaneFailure { index }) => self.restart(index).await,
                    None => break,
                },
            }
        }

        // Shutdown path: the dispatcher has already sent the sentinel to
        // every lane; wait for them to drain.
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("all worker lanes stopped");
    }

    async fn restart(&mut self, index: usize) {
        warn!(lane = index, "restarting dead worker lane");
        match self.factory.spawn(index) {
            Ok((tx, handle)) => {
                if index < self.handles.len() {
                    self.handles[index] = handle;
                }
                if self
                    .update_tx
                    .send(LaneUpdate::Replace { index, tx })
                    .await
                    .is_err()
                {
                    warn!(lane = index, "dispatcher gone; replacement lane not installed");
                }
            }
            Err(e) => {
                error!(lane = index, error = %e, "lane restart failed; clients on this lane drop");
            }
        }
    }
}
