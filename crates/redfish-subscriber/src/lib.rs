//! Declarative Redfish event-subscription management for a fleet of BMCs.
//!
//! The relay owns a desired set of event subscriptions per managed endpoint
//! (derived from configuration) and periodically converges each endpoint's
//! live subscription set toward it: unrecognized drift is removed, missing
//! subscriptions are created, and subscriptions owned by other consumers are
//! left alone. Convergence runs fleet-wide with bounded parallelism and
//! isolates per-endpoint failures.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod reconciler;
pub mod resolver;
pub mod subscription;

pub use client::{ClientError, RedfishSessionFactory, SessionFactory, SubscriptionSession};
pub use reconciler::{EndpointSpec, FleetSpec, ReconcileCommand, Reconciler};
pub use resolver::HostResolver;
pub use subscription::{DesiredSubscription, Endpoint, LiveSubscription};
