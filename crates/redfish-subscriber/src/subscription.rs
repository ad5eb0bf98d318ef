//! Subscription data model.
//!
//! A desired subscription is born from configuration and rewritten on reload,
//! never mutated in place. A live subscription is the same shape discovered
//! on the endpoint, plus the server-assigned handle used for deletion. The
//! context string is the authoritative identity key; every desired context
//! carries the relay's configured namespace prefix so that deletions never
//! touch subscriptions owned by other consumers.

use serde::{Deserialize, Serialize};

/// A managed endpoint: one BMC reachable over the Redfish protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub username: String,
    pub password: String,
}

/// The subscription state this relay wants present on an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSubscription {
    /// Push destination, `<host>:<port>/redfish`.
    pub destination: String,
    /// Identity key; always begins with the configured namespace prefix.
    pub context: String,
    pub registry_prefixes: Vec<String>,
    pub exclude_registry_prefixes: Vec<String>,
    pub message_ids: Vec<String>,
    pub exclude_message_ids: Vec<String>,
    pub protocol: String,
}

/// A subscription discovered on an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSubscription {
    /// Server-assigned resource path (`@odata.id`), used for deletion.
    pub handle: String,
    pub destination: String,
    pub context: String,
    pub registry_prefixes: Vec<String>,
    pub exclude_registry_prefixes: Vec<String>,
    pub message_ids: Vec<String>,
    pub exclude_message_ids: Vec<String>,
    pub protocol: String,
}

impl LiveSubscription {
    /// True when the live subscription carries the same context as `desired`.
    ///
    /// Context is the identity key: a partial match means this live entry is
    /// the one the desired subscription should own, whether or not the other
    /// fields have drifted.
    pub fn partial_match(&self, desired: &DesiredSubscription) -> bool {
        self.context == desired.context
    }

    /// True when every known field matches `desired` exactly.
    ///
    /// List fields compare order-insensitively and a missing field is
    /// equivalent to an empty list, so cosmetic reordering on the endpoint
    /// does not register as drift.
    pub fn full_match(&self, desired: &DesiredSubscription) -> bool {
        self.context == desired.context
            && self.destination == desired.destination
            && self.protocol == desired.protocol
            && sorted(&self.registry_prefixes) == sorted(&desired.registry_prefixes)
            && sorted(&self.exclude_registry_prefixes) == sorted(&desired.exclude_registry_prefixes)
            && sorted(&self.message_ids) == sorted(&desired.message_ids)
            && sorted(&self.exclude_message_ids) == sorted(&desired.exclude_message_ids)
    }
}

fn sorted(list: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = list.iter().map(String::as_str).collect();
    out.sort_unstable();
    out
}
