//! Diff-and-converge of event subscriptions across the fleet.
//!
//! Convergence is declarative: each cycle lists the live subscriptions on an
//! endpoint, diffs them against the desired set, removes drifted or orphaned
//! entries inside the relay's namespace, and creates what is missing.
//! Removes run before adds so a drifted subscription is replaced rather than
//! duplicated. Any single operation failure is logged and skipped; an
//! endpoint failure is isolated from the rest of the cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{ClientError, SessionFactory};
use crate::subscription::{DesiredSubscription, Endpoint, LiveSubscription};

/// Desired state for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub endpoint: Endpoint,
    pub desired: Vec<DesiredSubscription>,
}

/// Desired state for the whole fleet, plus the policy knobs the planner
/// needs. Rewritten wholesale on config reload.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    pub endpoints: Vec<EndpointSpec>,
    pub context_prefix: String,
    pub purge_unrecognized: bool,
    pub max_workers: usize,
    pub refresh_interval: Duration,
}

/// Commands accepted by the reconciler's control channel.
#[derive(Debug)]
pub enum ReconcileCommand {
    /// Replace the fleet spec (after a config reload) and run a cycle now.
    Reconcile(Arc<FleetSpec>),
    /// Run one cycle with an empty desired set everywhere, acknowledge, and
    /// stop.
    Purge(oneshot::Sender<()>),
    /// Stop after the in-flight endpoint call completes.
    Shutdown,
}

/// The outcome of diffing one endpoint's live set against its desired set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub adds: Vec<DesiredSubscription>,
    pub removes: Vec<LiveSubscription>,
    pub keeps: Vec<LiveSubscription>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }
}

/// Diff a desired set against a live set.
///
/// Context is the identity: a live entry with a desired context either fully
/// matches (keep) or has drifted (remove then add). Leftover live entries
/// are removed only when they carry the relay's namespace prefix, unless the
/// purge-unrecognized policy widens the scope to everything.
pub fn plan(
    desired: &[DesiredSubscription],
    live: Vec<LiveSubscription>,
    context_prefix: &str,
    purge_unrecognized: bool,
) -> Plan {
    let mut out = Plan::default();
    let mut remaining = live;

    for d in desired {
        match remaining.iter().position(|l| l.partial_match(d)) {
            Some(idx) => {
                let l = remaining.swap_remove(idx);
                if l.full_match(d) {
                    out.keeps.push(l);
                } else {
                    out.removes.push(l);
                    out.adds.push(d.clone());
                }
            }
            None => out.adds.push(d.clone()),
        }
    }

    for l in remaining {
        if l.context.starts_with(context_prefix) || purge_unrecognized {
            out.removes.push(l);
        } else {
            out.keeps.push(l);
        }
    }
    out
}

/// Per-endpoint result of one cycle, for the cycle summary log.
#[derive(Debug, Default)]
struct EndpointOutcome {
    created: usize,
    deleted: usize,
    kept: usize,
    failed_ops: usize,
}

pub struct Reconciler {
    factory: Arc<dyn SessionFactory>,
}

impl Reconciler {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }

    /// Run cycles until shutdown. A cycle runs at start and every
    /// `refresh_interval` thereafter; a cycle that overruns the interval is
    /// logged and the next one starts immediately. A control command aborts
    /// the cycle in progress rather than waiting for it.
    pub async fn run(self, mut spec: Arc<FleetSpec>, mut control: mpsc::Receiver<ReconcileCommand>) {
        loop {
            let started = Instant::now();
            let interrupted = tokio::select! {
                _ = self.run_cycle(&spec, false) => None,
                cmd = control.recv() => Some(cmd),
            };
            if let Some(cmd) = interrupted {
                let Some(cmd) = cmd else { return };
                if self.handle_command(cmd, &mut spec).await {
                    return;
                }
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed > spec.refresh_interval {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    interval_secs = spec.refresh_interval.as_secs(),
                    "reconcile cycle overran the refresh interval; starting next cycle now"
                );
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(spec.refresh_interval - elapsed) => {}
                cmd = control.recv() => {
                    let Some(cmd) = cmd else { return };
                    if self.handle_command(cmd, &mut spec).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when the reconciler should stop.
    async fn handle_command(&self, cmd: ReconcileCommand, spec: &mut Arc<FleetSpec>) -> bool {
        match cmd {
            ReconcileCommand::Reconcile(new_spec) => {
                info!(endpoints = new_spec.endpoints.len(), "out-of-cycle reconcile requested");
                *spec = new_spec;
                false
            }
            ReconcileCommand::Purge(ack) => {
                info!("purge cycle requested; treating every desired set as empty");
                self.run_cycle(spec, true).await;
                let _ = ack.send(());
                true
            }
            ReconcileCommand::Shutdown => true,
        }
    }

    /// One fleet-wide pass with bounded parallelism. `purge` empties the
    /// desired set for every endpoint.
    pub async fn run_cycle(&self, spec: &FleetSpec, purge: bool) {
        let started = Instant::now();
        let workers = spec.max_workers.max(1).min(spec.endpoints.len().max(1));
        let permits = Arc::new(Semaphore::new(workers));
        let mut joinset = JoinSet::new();

        for entry in &spec.endpoints {
            let factory = Arc::clone(&self.factory);
            let permits = Arc::clone(&permits);
            let endpoint = entry.endpoint.clone();
            // A purge cycle empties the desired set; the deletion scope
            // (namespace prefix, purge-unrecognized policy) is unchanged.
            let desired = if purge { Vec::new() } else { entry.desired.clone() };
            let context_prefix = spec.context_prefix.clone();
            let purge_unrecognized = spec.purge_unrecognized;

            joinset.spawn(async move {
                // Closed only at shutdown, when the cycle is abandoned anyway.
                let Ok(_permit) = permits.acquire().await else {
                    return None;
                };
                converge_endpoint(
                    factory.as_ref(),
                    &endpoint,
                    &desired,
                    &context_prefix,
                    purge_unrecognized,
                )
                .await
            });
        }

        let (mut converged, mut failed) = (0usize, 0usize);
        let (mut created, mut deleted) = (0usize, 0usize);
        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok(Some(outcome)) => {
                    converged += 1;
                    created += outcome.created;
                    deleted += outcome.deleted;
                }
                Ok(None) => failed += 1,
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "endpoint convergence task failed");
                }
            }
        }

        info!(
            endpoints = spec.endpoints.len(),
            converged,
            failed,
            created,
            deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            purge,
            "reconcile cycle finished"
        );
    }
}

/// Converge a single endpoint. Returns None when the endpoint could not be
/// reached or listed; individual operation failures are logged and skipped.
async fn converge_endpoint(
    factory: &dyn SessionFactory,
    endpoint: &Endpoint,
    desired: &[DesiredSubscription],
    context_prefix: &str,
    purge_unrecognized: bool,
) -> Option<EndpointOutcome> {
    let mut session = match factory.open(endpoint).await {
        Ok(s) => s,
        Err(e @ ClientError::Auth { .. }) | Err(e @ ClientError::Unreachable { .. }) => {
            debug!(host = %endpoint.host, error = %e, "skipping endpoint this cycle");
            return None;
        }
        Err(e) => {
            warn!(host = %endpoint.host, error = %e, "skipping endpoint this cycle");
            return None;
        }
    };

    let live = match session.list_subscriptions().await {
        Ok(live) => live,
        Err(e) => {
            warn!(host = %endpoint.host, error = %e, "listing subscriptions failed");
            session.close().await;
            return None;
        }
    };

    let plan = plan(desired, live, context_prefix, purge_unrecognized);
    if plan.is_noop() {
        debug!(host = %endpoint.host, kept = plan.keeps.len(), "endpoint already converged");
        session.close().await;
        return Some(EndpointOutcome {
            kept: plan.keeps.len(),
            ..Default::default()
        });
    }

    let mut outcome = EndpointOutcome {
        kept: plan.keeps.len(),
        ..Default::default()
    };

    // Removes before adds: a drifted subscription must not momentarily
    // coexist with its replacement.
    for stale in &plan.removes {
        match session.delete_subscription(&stale.handle).await {
            Ok(()) => {
                debug!(host = %endpoint.host, context = %stale.context, handle = %stale.handle,
                    "subscription removed");
                outcome.deleted += 1;
            }
            Err(e) => {
                warn!(host = %endpoint.host, context = %stale.context, error = %e,
                    "subscription delete failed");
                outcome.failed_ops += 1;
            }
        }
    }

    for wanted in &plan.adds {
        match session.create_subscription(wanted).await {
            Ok(live) => {
                debug!(host = %endpoint.host, context = %live.context, handle = %live.handle,
                    "subscription created");
                outcome.created += 1;
            }
            Err(e) => {
                warn!(host = %endpoint.host, context = %wanted.context, error = %e,
                    "subscription create failed");
                outcome.failed_ops += 1;
            }
        }
    }

    session.close().await;
    Some(outcome)
}
