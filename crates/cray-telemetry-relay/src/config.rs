//! Relay configuration.
//!
//! One YAML document drives both halves of the relay: the subscription
//! reconciler (which endpoints, which subscriptions) and the ingest
//! pipeline (lanes, sampling, bus). The `kafka` and `schema_registry`
//! sections are passed through opaquely to the producer. Configuration
//! errors are the only fatal errors in the daemon.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};

use redfish_subscriber::client::desired_from_properties;
use redfish_subscriber::reconciler::{EndpointSpec, FleetSpec};
use redfish_subscriber::subscription::{DesiredSubscription, Endpoint};
use telemetry_ingest::processor::SampleScope;

use crate::hostlist;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Hostlist(#[from] hostlist::HostlistError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Reconcile cadence, seconds.
    pub refresh_interval: u64,
    /// Legacy alias for `refresh_interval` from the older daemons; wins
    /// when both are present.
    pub resubscribe_interval: Option<u64>,
    /// Namespace prefix owned by this relay; scopes subscription deletion.
    pub context_prefix: String,
    /// Widen deletion to subscriptions outside the namespace.
    pub purge_unrecognized: bool,
    /// Reconciler parallelism cap.
    pub max_workers: usize,
    pub redfish_username: String,
    pub redfish_password: String,
    /// Prefix for the telemetry and event topics.
    pub topic_prefix: String,
    /// Minimum spacing between accepted telemetry events per source,
    /// seconds. Zero disables sampling.
    pub sample_period: u64,
    pub sample_scope: SampleScope,
    /// Ingest worker lanes.
    pub worker_count: usize,
    /// Listen address; also the default subscription destination host.
    pub address: String,
    pub port: u16,
    /// Endpoint session timeout, seconds.
    pub subscription_timeout: u64,
    pub subscription_retries: u32,
    /// Sample timestamps further than this from wall clock are replaced,
    /// seconds.
    pub clock_skew_limit: u64,
    pub log_alerts: bool,
    pub log_alerts_file: String,
    /// Dry run: log records instead of producing to the bus.
    pub no_kafka: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            refresh_interval: 600,
            resubscribe_interval: None,
            context_prefix: "dftfsub_".to_string(),
            purge_unrecognized: false,
            max_workers: 30,
            redfish_username: String::new(),
            redfish_password: String::new(),
            topic_prefix: String::new(),
            sample_period: 30,
            sample_scope: SampleScope::default(),
            worker_count: 8,
            address: String::new(),
            port: 9127,
            subscription_timeout: 30,
            subscription_retries: 1,
            clock_skew_limit: 300,
            log_alerts: false,
            log_alerts_file: "/var/log/cray-telemetry-relay/alerts.log".to_string(),
            no_kafka: false,
        }
    }
}

/// `servers: foo-cmm[1-4]` or `servers: [foo-cmm1, foo-cmm2]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerList {
    One(String),
    Many(Vec<String>),
}

impl ServerList {
    pub fn expand(&self) -> Result<Vec<String>, hostlist::HostlistError> {
        let mut out = Vec::new();
        match self {
            ServerList::One(list) => out.extend(hostlist::expand(list)?),
            ServerList::Many(lists) => {
                for list in lists {
                    out.extend(hostlist::expand(list)?);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntry {
    pub servers: ServerList,
    pub context: String,
    /// Extra subscription properties by their Redfish names, e.g.
    /// `RegistryPrefixes: [CrayTelemetry]`.
    #[serde(default)]
    pub properties: HashMap<String, Vec<String>>,
    /// Override destinations for this entry; defaults to this relay.
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub destinations_port: Option<u16>,
    /// Resolve destination hostnames to addresses before subscribing, for
    /// endpoints without working DNS.
    #[serde(default)]
    pub destinations_use_ip: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostSection {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaRegistryConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    /// Per-relay-hostname sections naming the endpoints each relay
    /// instance owns.
    #[serde(default)]
    pub hosts: HashMap<String, HostSection>,
    /// Opaque librdkafka properties.
    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    pub kafka: HashMap<String, String>,
    #[serde(default)]
    pub schema_registry: SchemaRegistryConfig,
}

/// YAML scalars in the kafka section arrive as strings, numbers, or bools;
/// librdkafka wants strings for all of them.
fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        String(String),
    }

    let raw: HashMap<String, Scalar> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Scalar::Bool(b) => b.to_string(),
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(f) => f.to_string(),
                Scalar::String(s) => s,
            };
            (key, value)
        })
        .collect())
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Read(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let config: RelayConfig = Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let general = &self.general;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&general.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level '{}' must be one of: trace, debug, info, warn, error",
                general.log_level
            )));
        }
        if general.context_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "context_prefix cannot be empty".to_string(),
            ));
        }
        if general.port == 0 {
            return Err(ConfigError::Invalid("port must be greater than 0".to_string()));
        }
        if general.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if general.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if general.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address cannot be empty".to_string()));
        }
        if general.redfish_username.is_empty() {
            return Err(ConfigError::Invalid(
                "redfish_username cannot be empty".to_string(),
            ));
        }

        for entry in &self.subscriptions {
            if !entry.context.starts_with(&general.context_prefix) {
                return Err(ConfigError::Invalid(format!(
                    "subscription context '{}' does not begin with context_prefix '{}'",
                    entry.context, general.context_prefix
                )));
            }
            // Fail early on a bad hostlist rather than at reconcile time.
            entry.servers.expand()?;
        }

        if !general.no_kafka {
            if !self.kafka.contains_key("bootstrap.servers") {
                return Err(ConfigError::Invalid(
                    "kafka section is missing bootstrap.servers".to_string(),
                ));
            }
            if self.schema_registry.url.is_empty() {
                return Err(ConfigError::Invalid(
                    "schema_registry section is missing url".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Reconcile cadence, honoring the legacy alias.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(
            self.general
                .resubscribe_interval
                .unwrap_or(self.general.refresh_interval),
        )
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.general.sample_period)
    }

    pub fn clock_skew_limit(&self) -> Duration {
        Duration::from_secs(self.general.clock_skew_limit)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_secs(self.general.subscription_timeout)
    }

    /// The endpoints this relay instance owns: the first `hosts` section
    /// matching one of our names.
    pub fn owned_endpoints(&self, local_names: &[String]) -> Result<Vec<String>, ConfigError> {
        let section = local_names
            .iter()
            .find_map(|name| self.hosts.get(name))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "no hosts section matches this relay (tried: {})",
                    local_names.join(", ")
                ))
            })?;

        let mut endpoints = Vec::new();
        let mut seen = HashSet::new();
        for list in &section.endpoints {
            for host in hostlist::expand(list)? {
                if seen.insert(host.clone()) {
                    endpoints.push(host);
                }
            }
        }
        if endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "matched hosts section lists no endpoints".to_string(),
            ));
        }
        Ok(endpoints)
    }

    /// Build the fleet's desired state: for each owned endpoint, the
    /// subscriptions whose server list names it, pointed at this relay (or
    /// the entry's destination overrides).
    pub fn fleet_spec(&self, local_names: &[String]) -> Result<FleetSpec, ConfigError> {
        let endpoints = self.owned_endpoints(local_names)?;
        let general = &self.general;

        // Expand every entry's server list once.
        let mut expanded: Vec<(HashSet<String>, &SubscriptionEntry)> = Vec::new();
        for entry in &self.subscriptions {
            expanded.push((entry.servers.expand()?.into_iter().collect(), entry));
        }

        let mut specs = Vec::with_capacity(endpoints.len());
        for host in endpoints {
            let mut desired = Vec::new();
            let mut identities = HashSet::new();
            for (servers, entry) in &expanded {
                if !servers.contains(&host) {
                    continue;
                }
                for sub in self.desired_for_entry(entry)? {
                    if !identities.insert((sub.destination.clone(), sub.context.clone())) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate subscription (destination '{}', context '{}') for endpoint '{host}'",
                            sub.destination, sub.context
                        )));
                    }
                    desired.push(sub);
                }
            }
            specs.push(EndpointSpec {
                endpoint: Endpoint {
                    host,
                    username: general.redfish_username.clone(),
                    password: general.redfish_password.clone(),
                },
                desired,
            });
        }

        Ok(FleetSpec {
            endpoints: specs,
            context_prefix: general.context_prefix.clone(),
            purge_unrecognized: general.purge_unrecognized,
            max_workers: general.max_workers,
            refresh_interval: self.refresh_interval(),
        })
    }

    fn desired_for_entry(
        &self,
        entry: &SubscriptionEntry,
    ) -> Result<Vec<DesiredSubscription>, ConfigError> {
        let port = entry.destinations_port.unwrap_or(self.general.port);
        let destination_hosts: Vec<String> = if entry.destinations.is_empty() {
            vec![self.general.address.clone()]
        } else {
            entry.destinations.clone()
        };

        let mut out = Vec::with_capacity(destination_hosts.len());
        for host in destination_hosts {
            let host = if entry.destinations_use_ip {
                destination_ip(&host).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "destination '{host}' cannot be resolved to an address"
                    ))
                })?
            } else {
                host
            };
            out.push(desired_from_properties(
                format!("{host}:{port}/redfish"),
                entry.context.clone(),
                &entry.properties,
            ));
        }
        Ok(out)
    }
}

fn destination_ip(host: &str) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Some(host.to_string());
    }
    dns_lookup::lookup_host(host)
        .ok()?
        .first()
        .map(IpAddr::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
general:
  log_level: debug
  refresh_interval: 120
  context_prefix: dftfsub_
  redfish_username: root
  redfish_password: initial0
  address: 10.0.0.1
  port: 9127
  topic_prefix: "redfish-"
  sample_period: 20
  worker_count: 4
  no_kafka: false

subscriptions:
  - servers: foo-cmm[1-2]
    context: dftfsub_telemetry
    properties:
      RegistryPrefixes: [CrayTelemetry]
  - servers:
      - foo-cmm1
    context: dftfsub_events

hosts:
  relay1:
    endpoints:
      - foo-cmm[1-2]

kafka:
  bootstrap.servers: broker:9092
  queue.buffering.max.ms: 50
  enable.idempotence: true

schema_registry:
  url: http://registry:8081
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn load(contents: &str) -> Result<RelayConfig, ConfigError> {
        RelayConfig::load(write_config(contents).path())
    }

    #[test]
    fn test_valid_config_loads() {
        let config = load(VALID).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.refresh_interval(), Duration::from_secs(120));
        assert_eq!(config.subscriptions.len(), 2);
        // Mixed-type kafka scalars arrive as strings.
        assert_eq!(config.kafka["queue.buffering.max.ms"], "50");
        assert_eq!(config.kafka["enable.idempotence"], "true");
    }

    #[test]
    fn test_missing_file() {
        let err = RelayConfig::load(Path::new("/nonexistent/relay.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn test_resubscribe_interval_alias_wins() {
        let config = load(&VALID.replace(
            "refresh_interval: 120",
            "refresh_interval: 120\n  resubscribe_interval: 45",
        ))
        .unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_context_outside_prefix_rejected() {
        let err = load(&VALID.replace("context: dftfsub_events", "context: rogue_events"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got {err:?}");
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let err = load(&VALID.replace("log_level: debug", "log_level: verbose")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_bootstrap_rejected_unless_no_kafka() {
        let without_kafka = VALID.replace("  bootstrap.servers: broker:9092\n", "");
        assert!(load(&without_kafka).is_err());

        let dry_run = without_kafka.replace("no_kafka: false", "no_kafka: true");
        assert!(load(&dry_run).is_ok());
    }

    #[test]
    fn test_owned_endpoints_matches_local_name() {
        let config = load(VALID).unwrap();
        let endpoints = config
            .owned_endpoints(&["relay1.mgmt.net".to_string(), "relay1".to_string()])
            .unwrap();
        assert_eq!(endpoints, vec!["foo-cmm1", "foo-cmm2"]);

        let err = config.owned_endpoints(&["other".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_fleet_spec_destinations_and_membership() {
        let config = load(VALID).unwrap();
        let spec = config.fleet_spec(&["relay1".to_string()]).unwrap();
        assert_eq!(spec.endpoints.len(), 2);
        assert_eq!(spec.context_prefix, "dftfsub_");
        assert_eq!(spec.refresh_interval, Duration::from_secs(120));

        // foo-cmm1 appears in both entries, foo-cmm2 only in the range.
        let cmm1 = spec
            .endpoints
            .iter()
            .find(|e| e.endpoint.host == "foo-cmm1")
            .unwrap();
        assert_eq!(cmm1.desired.len(), 2);
        assert_eq!(cmm1.desired[0].destination, "10.0.0.1:9127/redfish");
        assert_eq!(cmm1.desired[0].registry_prefixes, vec!["CrayTelemetry"]);
        assert_eq!(cmm1.endpoint.username, "root");

        let cmm2 = spec
            .endpoints
            .iter()
            .find(|e| e.endpoint.host == "foo-cmm2")
            .unwrap();
        assert_eq!(cmm2.desired.len(), 1);
        assert_eq!(cmm2.desired[0].context, "dftfsub_telemetry");
    }

    #[test]
    fn test_destination_overrides() {
        let config = load(&VALID.replace(
            "    context: dftfsub_events\n",
            "    context: dftfsub_events\n    destinations: [192.168.1.5]\n    destinations_port: 8000\n    destinations_use_ip: true\n",
        ))
        .unwrap();
        let spec = config.fleet_spec(&["relay1".to_string()]).unwrap();
        let cmm1 = spec
            .endpoints
            .iter()
            .find(|e| e.endpoint.host == "foo-cmm1")
            .unwrap();
        let events = cmm1
            .desired
            .iter()
            .find(|d| d.context == "dftfsub_events")
            .unwrap();
        assert_eq!(events.destination, "192.168.1.5:8000/redfish");
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let config = load(&VALID.replace("context: dftfsub_events", "context: dftfsub_telemetry"))
            .unwrap();
        // Both entries now produce (same destination, same context) for
        // foo-cmm1.
        let err = config.fleet_spec(&["relay1".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_defaults() {
        let general = GeneralConfig::default();
        assert_eq!(general.refresh_interval, 600);
        assert_eq!(general.context_prefix, "dftfsub_");
        assert_eq!(general.sample_period, 30);
        assert_eq!(general.clock_skew_limit, 300);
        assert!(!general.purge_unrecognized);
    }
}
